//! Conversion of in-memory reads to output records.
//!
//! A pure transformation: each read becomes an unmapped primary record
//! carrying the auxiliary tags downstream consumers expect (`mv`, `ts`,
//! `MM`/`ML`, `BC`, `qs`, `RG`). A duplex consensus read additionally
//! yields one supplementary provenance record per source strand. The raw
//! signal is dropped here; nothing downstream needs it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::{DuplexRead, Message, ModBaseInfo, ReadCommon};
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::sam::{move_table_tag, SamRecord, TagValue, FLAG_SUPPLEMENTARY, FLAG_UNMAPPED};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

/// Build the `MM` tag string and `ML` byte array from per-base channel
/// probabilities.
///
/// Every canonical-base position carries a probability, so the delta list is
/// all zeros: one `0` per site per channel group.
#[must_use]
pub fn modbase_tags(seq: &[u8], probs: &[u8], info: &ModBaseInfo) -> (String, Vec<u8>) {
    let mut mm = String::new();
    let mut ml = Vec::new();
    let channels = info.channel_count;
    let mut channel = 0usize;
    while channel < channels {
        let canonical = info.canonical_bases.as_bytes()[channel];
        // Channels of one model share a canonical base and sit adjacently.
        let mut group_len = 1;
        while channel + group_len < channels
            && info.canonical_bases.as_bytes()[channel + group_len] == canonical
        {
            group_len += 1;
        }
        let codes = &info.alphabet[channel..channel + group_len];
        mm.push(char::from(canonical));
        mm.push('+');
        mm.push_str(codes);
        mm.push('?');
        for (pos, &base) in seq.iter().enumerate() {
            if base == canonical {
                mm.push_str(",0");
                for c in 0..group_len {
                    ml.push(probs[pos * channels + channel + c]);
                }
            }
        }
        mm.push(';');
        channel += group_len;
    }
    (mm, ml)
}

/// Convert one read body into an output record.
#[must_use]
pub fn to_record(common: &ReadCommon, emit_moves: bool, duplex: bool) -> SamRecord {
    let qual: Vec<u8> = common.qstring.iter().map(|&q| q.saturating_sub(33)).collect();
    let mut record = SamRecord::unmapped(common.read_id.clone(), common.seq.clone(), qual);

    record.set_tag(*b"qs", TagValue::Float(common.mean_qscore()));
    record.set_tag(*b"ts", TagValue::Int(common.num_trimmed_samples as i64));
    if duplex {
        record.set_tag(*b"dx", TagValue::Int(1));
    }
    if emit_moves && !common.moves.is_empty() {
        record.set_tag(
            *b"mv",
            TagValue::ByteArray(move_table_tag(common.model_stride, &common.moves)),
        );
    }
    if let (Some(probs), Some(info)) = (&common.base_mod_probs, &common.mod_base_info) {
        let (mm, ml) = modbase_tags(&common.seq, probs, info);
        record.set_tag(*b"MM", TagValue::String(mm));
        record.set_tag(*b"ML", TagValue::ByteArray(ml));
    }
    if let Some(barcode) = &common.barcode {
        record.set_tag(*b"BC", TagValue::String(barcode.clone()));
    }
    if !common.read_group.is_empty() {
        record.set_tag(*b"RG", TagValue::String(common.read_group.clone()));
    }
    if common.rna_poly_tail_length >= 0 {
        record.set_tag(*b"pt", TagValue::Int(i64::from(common.rna_poly_tail_length)));
    }
    if let Some(failure) = common.failure {
        record.set_tag(*b"XF", TagValue::String(failure.to_string()));
    }
    record
}

/// Records for one duplex read: the consensus primary plus one
/// supplementary provenance record per source strand.
///
/// The supplementaries share the duplex read's query name so they travel in
/// its record group; the `ps` tag names the originating strand. They carry
/// no sequence, so FASTQ output drops them at the writer.
#[must_use]
pub fn duplex_records(read: &DuplexRead, emit_moves: bool) -> Vec<SamRecord> {
    let mut records = vec![to_record(&read.common, emit_moves, true)];
    for source_id in [&read.source_ids.0, &read.source_ids.1] {
        if source_id.is_empty() {
            continue;
        }
        let mut supp = SamRecord {
            qname: read.common.read_id.clone(),
            flags: FLAG_UNMAPPED | FLAG_SUPPLEMENTARY,
            ..SamRecord::default()
        };
        supp.set_tag(*b"dx", TagValue::Int(1));
        supp.set_tag(*b"ps", TagValue::String(source_id.clone()));
        if !read.common.read_group.is_empty() {
            supp.set_tag(*b"RG", TagValue::String(read.common.read_group.clone()));
        }
        records.push(supp);
    }
    records
}

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    emit_moves: bool,
    num_records_out: AtomicU64,
}

impl Inner {
    fn worker_loop(&self) {
        while let Some(msg) = self.input.pop() {
            let converted = match msg {
                Message::SimplexRead(read) => {
                    vec![to_record(&read.common, self.emit_moves, false)]
                }
                Message::DuplexRead(read) => duplex_records(&read, self.emit_moves),
                other => {
                    send_to_sink(&self.sink, other);
                    continue;
                }
            };
            for record in converted {
                self.num_records_out.fetch_add(1, Ordering::Relaxed);
                send_to_sink(&self.sink, Message::SamRecord(Box::new(record)));
            }
        }
    }
}

/// Worker-pool node converting reads into records.
pub struct ReadToBamTypeNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadToBamTypeNode {
    #[must_use]
    pub fn new(sink: NodeHandle, emit_moves: bool, num_threads: usize, queue_capacity: usize) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                emit_moves,
                num_records_out: AtomicU64::new(0),
            }),
            num_threads: num_threads.max(1),
            workers: Mutex::new(Vec::new()),
        };
        node.start_workers();
        node
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock();
        for i in 0..self.num_threads {
            let inner = Arc::clone(&self.inner);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("read_converter_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn read converter thread"),
            );
        }
    }
}

impl PipelineNode for ReadToBamTypeNode {
    fn name(&self) -> &'static str {
        "read_converter"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_records_out".to_string(),
            self.inner.num_records_out.load(Ordering::Relaxed) as f64,
        );
        stats.insert("work_queue_depth".to_string(), self.inner.input.len() as f64);
        stats
    }

    fn terminate(&self, _flush: &FlushOptions) {
        self.inner.input.terminate();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }

    fn restart(&self) {
        self.inner.input.restart();
        self.start_workers();
    }
}
