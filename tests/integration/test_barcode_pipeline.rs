//! Barcode classification feeding record conversion: the classified
//! barcode lands in the BC tag and trimming shows up in the output record.

use std::sync::Arc;

use crate::helpers::SharedBuffer;
use squall_lib::barcode::BarcodeClassifierNode;
use squall_lib::messages::{BarcodingInfo, Message, SimplexRead};
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::writer::{OutputMode, WriterNode};

const BC01: &str = "AAGAAAGTTGTCGGTGTCTTTGTG";

fn barcoded_read(id: &str) -> Message {
    let mut seq = BC01.as_bytes().to_vec();
    seq.extend_from_slice(&b"ACGT".repeat(50));
    let mut read = SimplexRead::default();
    read.common.read_id = id.to_string();
    read.common.qstring = vec![b'9'; seq.len()];
    read.common.moves = vec![1; seq.len()];
    read.common.seq = seq;
    read.common.model_stride = 5;
    Message::SimplexRead(Box::new(read))
}

#[test]
fn test_classified_barcode_reaches_output_record() {
    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 1, 64));
    writer.write_header(&[]).unwrap();
    desc.add_node(writer.clone());
    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(writer.clone(), false, 1, 64)));
    let info = BarcodingInfo {
        kit_name: "SQK-RBK004".to_string(),
        barcode_both_ends: false,
        trim: true,
    };
    desc.add_node(Arc::new(BarcodeClassifierNode::new(converter, Some(info), 2, 64)));
    let pipeline = Pipeline::create(desc);

    pipeline.push_message(barcoded_read("r1")).unwrap();
    pipeline.terminate(&FlushOptions::default());

    let text = buffer.text();
    let record_line = text.lines().next().unwrap();
    assert!(record_line.contains("BC:Z:RB01"), "missing barcode tag: {record_line}");
    // The barcode was trimmed off the front of the sequence.
    let fields: Vec<&str> = record_line.split('\t').collect();
    assert_eq!(fields[9].len(), 200);
    // Trimmed move-table positions are reflected in the ts tag.
    assert!(record_line.contains(&format!("ts:i:{}", 5 * BC01.len())));

    let stats = pipeline.sample_stats();
    assert_eq!(stats["barcode_classifier.num_barcodes_demuxed"], 1.0);
}
