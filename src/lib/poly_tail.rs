//! Poly(A)/poly(T) tail estimation.
//!
//! The estimator anchors on a configured primer (or plasmid flank) near the
//! tail and counts the homopolymer run, tolerating interruptions up to a
//! configured length. Reads whose tail cannot be anchored keep the sentinel
//! value -1.

use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::Message;
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

const DEFAULT_FRONT_PRIMER: &str = "TTTCTGTTGGTGCTGATATTGCTTT";
const DEFAULT_REAR_PRIMER: &str = "ACTTGCCTGTCGCTCTATCTTC";

/// Reverse complement of a DNA string; non-ACGT bases map to `N`.
#[must_use]
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| match b {
            b'A' => 'T',
            b'C' => 'G',
            b'G' => 'C',
            b'T' => 'A',
            b'a' => 't',
            b'c' => 'g',
            b'g' => 'c',
            b't' => 'a',
            _ => 'N',
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct AnchorsSection {
    front_primer: Option<String>,
    rear_primer: Option<String>,
    plasmid_front_flank: Option<String>,
    plasmid_rear_flank: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TailSection {
    tail_interrupt_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PolyTailToml {
    #[serde(default)]
    anchors: AnchorsSection,
    #[serde(default)]
    tail: TailSection,
}

/// Parsed poly(A) configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolyTailConfig {
    pub front_primer: String,
    pub rear_primer: String,
    pub rc_front_primer: String,
    pub rc_rear_primer: String,
    pub plasmid_front_flank: String,
    pub plasmid_rear_flank: String,
    pub rc_plasmid_front_flank: String,
    pub rc_plasmid_rear_flank: String,
    pub is_plasmid: bool,
    pub tail_interrupt_length: usize,
}

impl Default for PolyTailConfig {
    fn default() -> Self {
        let front_primer = DEFAULT_FRONT_PRIMER.to_string();
        let rear_primer = DEFAULT_REAR_PRIMER.to_string();
        Self {
            rc_front_primer: reverse_complement(&front_primer),
            rc_rear_primer: reverse_complement(&rear_primer),
            front_primer,
            rear_primer,
            plasmid_front_flank: String::new(),
            plasmid_rear_flank: String::new(),
            rc_plasmid_front_flank: String::new(),
            rc_plasmid_rear_flank: String::new(),
            is_plasmid: false,
            tail_interrupt_length: 0,
        }
    }
}

/// Parse a poly(A) configuration file, falling back to defaults when no
/// path is given.
///
/// # Errors
///
/// A configuration providing only one primer of a pair, or only one plasmid
/// flank of a pair, is rejected.
pub fn prepare_config(path: Option<&Path>) -> Result<PolyTailConfig> {
    let mut config = PolyTailConfig::default();
    let Some(path) = path else {
        return Ok(config);
    };

    let text = std::fs::read_to_string(path).map_err(|e| SquallError::InvalidFileFormat {
        file_type: "PolyA configuration".to_string(),
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let parsed: PolyTailToml =
        toml::from_str(&text).map_err(|e| SquallError::InvalidFileFormat {
            file_type: "PolyA configuration".to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let anchors = parsed.anchors;
    if anchors.front_primer.is_some() != anchors.rear_primer.is_some() {
        return Err(SquallError::InvalidParameter {
            parameter: "anchors".to_string(),
            reason: "Both front_primer and rear_primer must be provided in the PolyA \
                     configuration file."
                .to_string(),
        });
    }
    if anchors.plasmid_front_flank.is_some() != anchors.plasmid_rear_flank.is_some() {
        return Err(SquallError::InvalidParameter {
            parameter: "anchors".to_string(),
            reason: "Both plasmid_front_flank and plasmid_rear_flank must be provided in the \
                     PolyA configuration file."
                .to_string(),
        });
    }

    if let (Some(front), Some(rear)) = (anchors.front_primer, anchors.rear_primer) {
        config.rc_front_primer = reverse_complement(&front);
        config.rc_rear_primer = reverse_complement(&rear);
        config.front_primer = front;
        config.rear_primer = rear;
    }
    if let (Some(front), Some(rear)) = (anchors.plasmid_front_flank, anchors.plasmid_rear_flank) {
        config.rc_plasmid_front_flank = reverse_complement(&front);
        config.rc_plasmid_rear_flank = reverse_complement(&rear);
        config.plasmid_front_flank = front;
        config.plasmid_rear_flank = rear;
        config.is_plasmid = true;
    }
    if let Some(interrupt) = parsed.tail.tail_interrupt_length {
        config.tail_interrupt_length = interrupt;
    }
    Ok(config)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Count a homopolymer run of `base` starting at `start`, tolerating
/// interruptions of at most `interrupt` consecutive other bases.
fn count_tail(seq: &[u8], start: usize, base: u8, interrupt: usize) -> usize {
    let mut count = 0usize;
    let mut gap = 0usize;
    let mut pending = 0usize;
    for &b in &seq[start..] {
        if b == base {
            count += 1 + pending;
            pending = 0;
            gap = 0;
        } else {
            gap += 1;
            pending += 1;
            if gap > interrupt {
                break;
            }
        }
    }
    count
}

/// Estimate the tail length of one read, or `None` when no anchor is found.
#[must_use]
pub fn estimate_tail_length(seq: &[u8], config: &PolyTailConfig, is_rna: bool) -> Option<i32> {
    if seq.is_empty() {
        return None;
    }
    let interrupt = config.tail_interrupt_length;

    // RNA reads present the tail as poly(A) at the 3' end ahead of the rear
    // anchor; cDNA reads carry the reverse-complemented tail as poly(T)
    // behind the front anchor.
    let front_anchor =
        if config.is_plasmid { &config.plasmid_front_flank } else { &config.front_primer };
    if let Some(pos) = find_subsequence(seq, front_anchor.as_bytes()) {
        let start = pos + front_anchor.len();
        if start < seq.len() {
            let base = if is_rna { b'A' } else { b'T' };
            let count = count_tail(seq, start, base, interrupt);
            if count > 0 {
                return Some(count as i32);
            }
        }
    }

    let rc_anchor = if config.is_plasmid {
        &config.rc_plasmid_rear_flank
    } else {
        &config.rc_rear_primer
    };
    if let Some(pos) = find_subsequence(seq, rc_anchor.as_bytes()) {
        let start = pos + rc_anchor.len();
        if start < seq.len() {
            let count = count_tail(seq, start, b'A', interrupt);
            if count > 0 {
                return Some(count as i32);
            }
        }
    }

    None
}

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    config: PolyTailConfig,
    is_rna: bool,
    num_estimated: AtomicU64,
    num_not_estimated: AtomicU64,
}

impl Inner {
    fn worker_loop(&self) {
        while let Some(mut msg) = self.input.pop() {
            if let Some(common) = msg.read_common_mut() {
                match estimate_tail_length(&common.seq, &self.config, self.is_rna) {
                    Some(len) => {
                        common.rna_poly_tail_length = len;
                        self.num_estimated.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        common.rna_poly_tail_length = -1;
                        self.num_not_estimated.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            send_to_sink(&self.sink, msg);
        }
    }
}

/// Worker-pool node estimating poly(A) tail lengths.
pub struct PolyACalculatorNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PolyACalculatorNode {
    #[must_use]
    pub fn new(
        sink: NodeHandle,
        config: PolyTailConfig,
        is_rna: bool,
        num_threads: usize,
        queue_capacity: usize,
    ) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                config,
                is_rna,
                num_estimated: AtomicU64::new(0),
                num_not_estimated: AtomicU64::new(0),
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
                    .name(format!("poly_a_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn poly(A) thread"),
            );
        }
    }
}

impl PipelineNode for PolyACalculatorNode {
    fn name(&self) -> &'static str {
        "poly_a_calculator"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_estimated".to_string(),
            self.inner.num_estimated.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "num_not_estimated".to_string(),
            self.inner.num_not_estimated.load(Ordering::Relaxed) as f64,
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
