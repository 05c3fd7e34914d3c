//! End-to-end basecalling: scaler -> basecaller -> filter -> converter ->
//! writer, with the invariants the pipeline promises.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

use crate::helpers::{cpu_runner, move_popcount, raw_read, CaptureSink, SharedBuffer};
use squall_lib::basecaller::BasecallerNode;
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::read_filter::ReadFilterNode;
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::scaler::ScalerNode;
use squall_lib::writer::{OutputMode, WriterNode};

#[test]
fn test_single_short_read_fastq_to_writer() {
    // One 4000-sample read on CPU, chunk size 2000, overlap 400: the chunks
    // fit one batch and one FASTQ block reaches the writer.
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
            vec![cpu_runner(5, 2000, 16)],
            400,
            Duration::from_millis(100),
            64,
        )
        .unwrap(),
    ));
    let scaler = desc.add_node(Arc::new(ScalerNode::new(basecaller, 1, 10, 64)));
    let pipeline = Pipeline::create(desc);

    pipeline.push_message(raw_read("read-1", 4000)).unwrap();
    pipeline.terminate(&FlushOptions::default());

    let stats = pipeline.sample_stats();
    assert_eq!(stats.get("basecaller.num_batches_called"), Some(&1.0));
    assert_eq!(stats.get("basecaller.num_chunks_in"), Some(&2.0));
    assert_eq!(stats.get("writer.num_records_written"), Some(&1.0));

    let text = buffer.text();
    assert!(text.starts_with("@read-1\n"), "fastq must start with the read id: {text}");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1].len(), lines[3].len());
    assert!(!lines[1].is_empty());
}

#[test]
fn test_basecalled_read_invariants() {
    let sink = CaptureSink::new(256);
    let mut desc = PipelineDescriptor::new();
    desc.add_node(sink.clone());
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            sink.clone(),
            vec![cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(20),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 2, 10, 64)));
    let pipeline = Pipeline::create(desc);

    let lens = [950usize, 1500, 2600, 430, 5000];
    for (i, len) in lens.iter().enumerate() {
        pipeline.push_message(raw_read(&format!("r{i}"), *len)).unwrap();
    }
    pipeline.terminate(&FlushOptions::default());

    let messages = sink.messages.lock();
    assert_eq!(messages.len(), lens.len());
    for msg in messages.iter() {
        let common = msg.read_common().unwrap();
        // popcount(moves) == len(seq) == len(qstring)
        assert_eq!(move_popcount(&common.moves), common.seq.len());
        assert_eq!(common.seq.len(), common.qstring.len());
        // len(moves) == len(scaled_signal) / stride, with the scaled length
        // being the trimmed raw length truncated to a stride multiple.
        let raw_len = common.raw_signal.len();
        let scaled_len = (raw_len - common.num_trimmed_samples) / 5 * 5;
        assert_eq!(common.moves.len(), scaled_len / 5);
        assert!(common.scaled_signal.is_empty());
    }
}

#[test]
fn test_pipeline_conservation() {
    // reads_in == reads_filtered + reads_failed + records_written
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 2, 64));
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 2, 64)));
    // A threshold high enough that some synthetic reads fail it.
    let filter = desc.add_node(Arc::new(ReadFilterNode::new(converter, 14.0, 2, 64)));
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            filter,
            vec![cpu_runner(5, 500, 8), cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(20),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 4, 10, 64)));
    let pipeline = Pipeline::create(desc);

    let mut rng = StdRng::seed_from_u64(11);
    let total = 60usize;
    for i in 0..total {
        pipeline.push_message(raw_read(&format!("r{i}"), rng.gen_range(500..4000))).unwrap();
    }
    pipeline.terminate(&FlushOptions::default());

    let stats = pipeline.sample_stats();
    let reads_in = stats["basecaller.num_reads_in"];
    let filtered = stats["read_filter.num_filtered"];
    let failed = stats["basecaller.num_failed_reads"];
    let written = stats["writer.num_records_written"];
    assert_eq!(reads_in, total as f64);
    assert_eq!(reads_in, filtered + failed + written);
}

#[test]
fn test_no_message_loss_on_shutdown() {
    // After terminate(wait_for_idle), every read pushed has been seen at
    // the writer input.
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 1, 64));
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 64)));
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            converter,
            vec![cpu_runner(5, 500, 64)],
            100,
            Duration::from_millis(50),
            64,
        )
        .unwrap(),
    ));
    desc.add_node(Arc::new(ScalerNode::new(basecaller, 2, 0, 64)));
    let pipeline = Pipeline::create(desc);

    let total = 40usize;
    for i in 0..total {
        pipeline.push_message(raw_read(&format!("r{i}"), 800)).unwrap();
    }
    pipeline.terminate(&FlushOptions { wait_for_idle: true });

    let stats = pipeline.sample_stats();
    assert_eq!(stats["writer.num_records_received"], total as f64);
}
