//! Modified-base calling between the basecaller and the record converter:
//! every channel position is populated and the MM/ML tags reach the writer.

use std::sync::Arc;
use std::time::Duration;

use crate::helpers::{cpu_runner, raw_read, CaptureSink, SharedBuffer};
use squall_lib::basecaller::BasecallerNode;
use squall_lib::modbase::{ModBaseCallerNode, RemoraCaller, RemoraParams};
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::scaler::ScalerNode;
use squall_lib::writer::{OutputMode, WriterNode};

fn caller() -> RemoraCaller {
    let params = RemoraParams {
        model_name: "5mCG".to_string(),
        alphabet: "hm".to_string(),
        canonical: b'C',
        context_samples: 30,
    };
    RemoraCaller::new(params, None, 16)
}

#[test]
fn test_modbase_probs_cover_whole_read() {
    let sink = CaptureSink::new(64);
    let mut desc = PipelineDescriptor::new();
    desc.add_node(sink.clone());
    let modbase = desc.add_node(Arc::new(
        ModBaseCallerNode::new(sink.clone(), vec![caller()], 2, Duration::from_millis(10), 64)
            .unwrap(),
    ));
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            modbase,
            vec![cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(10),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 2, 10, 64)));
    let pipeline = Pipeline::create(desc);

    pipeline.push_message(raw_read("r1", 2200)).unwrap();
    pipeline.terminate(&FlushOptions::default());

    let messages = sink.messages.lock();
    assert_eq!(messages.len(), 1);
    let common = messages[0].read_common().unwrap();
    let info = common.mod_base_info.as_ref().expect("modbase info attached");
    assert_eq!(info.channel_count, 2);
    let probs = common.base_mod_probs.as_ref().expect("probs attached");
    assert_eq!(probs.len(), common.seq.len() * info.channel_count);
}

#[test]
fn test_modbase_tags_reach_writer() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 1, 64));
    writer.write_header(&[]).unwrap();
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 64)));
    let modbase = desc.add_node(Arc::new(
        ModBaseCallerNode::new(converter, vec![caller()], 2, Duration::from_millis(10), 64)
            .unwrap(),
    ));
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            modbase,
            vec![cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(10),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 2, 10, 64)));
    let pipeline = Pipeline::create(desc);

    pipeline.push_message(raw_read("r1", 1800)).unwrap();
    pipeline.terminate(&FlushOptions::default());

    let text = buffer.text();
    let record_line = text.lines().next().unwrap();
    assert!(record_line.contains("MM:Z:C+hm?"), "missing MM tag: {record_line}");
    assert!(record_line.contains("ML:B:c"), "missing ML tag: {record_line}");
}
