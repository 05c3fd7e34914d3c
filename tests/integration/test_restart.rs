//! Restart idempotence: terminate, restart, and re-run the same input;
//! with single-worker nodes and a deterministic runner the output bytes
//! match the first run exactly.

use std::sync::Arc;
use std::time::Duration;

use crate::helpers::{cpu_runner, raw_read, SharedBuffer};
use squall_lib::basecaller::BasecallerNode;
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::read_filter::ReadFilterNode;
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::scaler::ScalerNode;
use squall_lib::writer::{OutputMode, WriterNode};

fn push_inputs(pipeline: &Pipeline) {
    for (i, len) in [1200usize, 2600, 700].iter().enumerate() {
        pipeline.push_message(raw_read(&format!("r{i}"), *len)).unwrap();
    }
}

#[test]
fn test_terminate_restart_rerun_is_byte_identical() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Fastq, 1, 64));
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 64)));
    let filter = desc.add_node(Arc::new(ReadFilterNode::new(converter, 0.0, 1, 64)));
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            filter,
            vec![cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(20),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 1, 10, 64)));
    let pipeline = Pipeline::create(desc);

    push_inputs(&pipeline);
    pipeline.terminate(&FlushOptions::default());
    let first_run = buffer.text();
    assert!(!first_run.is_empty());

    // Restart is only legal after a full shutdown; the second run must
    // reproduce the first byte for byte.
    buffer.0.lock().clear();
    pipeline.restart();
    push_inputs(&pipeline);
    pipeline.terminate(&FlushOptions::default());
    let second_run = buffer.text();

    assert_eq!(first_run, second_run);
}

#[test]
fn test_push_after_terminate_fails_until_restart() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer), OutputMode::Fastq, 1, 16));
    desc.add_node(writer.clone());
    desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 16)));
    let pipeline = Pipeline::create(desc);

    pipeline.terminate(&FlushOptions::default());
    assert!(pipeline.push_message(raw_read("late", 100)).is_err());

    pipeline.restart();
    assert!(pipeline.push_message(raw_read("ok", 100)).is_ok());
    pipeline.terminate(&FlushOptions::default());
}
