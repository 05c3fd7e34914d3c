//! Filtering and writing: drop counts, ordering through a single-worker
//! filter, and writer accounting.

use std::sync::Arc;

use crate::helpers::SharedBuffer;
use squall_lib::messages::{Message, SimplexRead};
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::read_filter::ReadFilterNode;
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::writer::{OutputMode, WriterNode};

fn called_read(id: &str, phred: u8) -> Message {
    let mut read = SimplexRead::default();
    read.common.read_id = id.to_string();
    read.common.seq = b"ACGTACGTAC".to_vec();
    read.common.qstring = vec![phred + 33; 10];
    read.common.moves = vec![1; 10];
    read.common.model_stride = 5;
    Message::SimplexRead(Box::new(read))
}

#[test]
fn test_filter_drops_exactly_the_low_quality_reads() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Fastq, 1, 256));
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 256)));
    desc.add_node(Arc::new(ReadFilterNode::new(converter, 10.0, 1, 256)));
    let pipeline = Pipeline::create(desc);

    // 100 reads; 30 sit below the quality threshold.
    for i in 0..100 {
        let phred = if i % 10 < 3 { 4 } else { 20 };
        pipeline.push_message(called_read(&format!("read-{i:03}"), phred)).unwrap();
    }
    pipeline.terminate(&FlushOptions::default());

    let stats = pipeline.sample_stats();
    assert_eq!(stats["read_filter.num_filtered"], 30.0);
    assert_eq!(stats["writer.num_records_written"], 70.0);

    // A single-worker filter preserves relative order of accepted reads.
    let text = buffer.text();
    let ids: Vec<&str> =
        text.lines().filter(|l| l.starts_with('@')).map(|l| &l[1..]).collect();
    assert_eq!(ids.len(), 70);
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "accepted reads must stay in push order");
}

#[test]
fn test_writer_header_and_records_in_sam_mode() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 1, 64));
    writer
        .write_header(&[
            "@HD\tVN:1.6\tSO:unknown".to_string(),
            "@PG\tID:basecaller\tPN:squall\tVN:0.4.0\tCL:squall basecaller".to_string(),
        ])
        .unwrap();
    desc.add_node(writer.clone());
    desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), true, 1, 64)));
    let pipeline = Pipeline::create(desc);

    pipeline.push_message(called_read("r1", 20)).unwrap();
    pipeline.terminate(&FlushOptions::default());

    let text = buffer.text();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("@HD\t"));
    assert!(lines[1].starts_with("@PG\t"));
    assert!(lines[2].starts_with("r1\t4\t*\t0\t"));
    assert!(lines[2].contains("mv:B:c,5,"));
    assert!(lines[2].contains("qs:f:20"));
}
