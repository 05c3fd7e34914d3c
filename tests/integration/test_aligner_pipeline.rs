//! Aligner feeding a multi-threaded writer: each query produces a primary
//! plus supplementary records, and the writer must keep every read's
//! records in the order the aligner emitted them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write as _;
use std::sync::Arc;

use crate::helpers::SharedBuffer;
use squall_lib::aligner::{AlignerNode, MinimizerIndex};
use squall_lib::messages::Message;
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor};
use squall_lib::sam::{SamRecord, FLAG_SUPPLEMENTARY, FLAG_UNMAPPED};
use squall_lib::writer::{OutputMode, WriterNode};

fn random_sequence(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

#[test]
fn test_multi_record_reads_stay_ordered_through_parallel_writer() {
    // The same repeat in three contigs, so every query aligns to all three
    // and the aligner emits one primary plus two supplementaries per read.
    let mut rng = StdRng::seed_from_u64(99);
    let repeat = random_sequence(&mut rng, 800);
    let mut reference = tempfile::NamedTempFile::new().unwrap();
    for name in ["c-contig", "a-contig", "b-contig"] {
        writeln!(reference, ">{name}").unwrap();
        reference.write_all(&repeat).unwrap();
        writeln!(reference).unwrap();
    }
    let index = MinimizerIndex::build(reference.path(), 15, 10).unwrap();

    let buffer = SharedBuffer::default();
    let mut desc = PipelineDescriptor::new();
    let writer =
        Arc::new(WriterNode::with_output(Box::new(buffer.clone()), OutputMode::Sam, 4, 64));
    writer.write_header(&[]).unwrap();
    desc.add_node(writer.clone());
    desc.add_node(Arc::new(AlignerNode::new(writer.clone(), index, 2, 64)));
    let pipeline = Pipeline::create(desc);

    let total_reads = 40usize;
    for i in 0..total_reads {
        let start = 50 + (i % 7) * 40;
        let query = repeat[start..start + 400].to_vec();
        let record =
            SamRecord::unmapped(format!("read-{i:03}"), query, vec![20; 400]);
        pipeline.push_message(Message::SamRecord(Box::new(record))).unwrap();
    }
    pipeline.terminate(&FlushOptions::default());

    let text = buffer.text();
    let mut groups: std::collections::BTreeMap<String, Vec<(u16, String, usize)>> =
        std::collections::BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        let flags: u16 = fields[1].parse().unwrap();
        let pos: usize = fields[3].parse().unwrap();
        groups.entry(fields[0].to_string()).or_default().push((
            flags,
            fields[2].to_string(),
            pos,
        ));
    }

    assert_eq!(groups.len(), total_reads);
    for (qname, records) in &groups {
        assert_eq!(records.len(), 3, "read {qname} should hit all three contigs");
        // The primary leads its group; supplementaries follow in the
        // deterministic (target, position, CIGAR) order the aligner chose.
        let (primary_flags, _, _) = records[0];
        assert_eq!(primary_flags & FLAG_UNMAPPED, 0);
        assert_eq!(primary_flags & FLAG_SUPPLEMENTARY, 0, "{qname} primary out of order");
        let supp: Vec<(String, usize)> =
            records[1..].iter().map(|(_, target, pos)| (target.clone(), *pos)).collect();
        let mut sorted = supp.clone();
        sorted.sort();
        assert_eq!(supp, sorted, "{qname} supplementaries out of order");
        for (flags, _, _) in &records[1..] {
            assert_ne!(flags & FLAG_SUPPLEMENTARY, 0);
        }
    }

    let stats = pipeline.sample_stats();
    assert_eq!(stats["writer.num_records_written"], (total_reads * 3) as f64);
    assert_eq!(stats["aligner.num_records_aligned"], total_reads as f64);
}
