//! Reference alignment via a minimizer index.
//!
//! The index stores `(k, w)` minimizers of both strands of every target
//! sequence. Each query record is seeded against the index and scored by
//! diagonal voting; the best diagonal becomes the primary alignment and
//! lesser diagonals become supplementary records. Supplementary records are
//! ordered by target name, then position, then CIGAR, so output is
//! reproducible across worker interleavings.

use ahash::AHashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::Message;
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::sam::{SamRecord, FLAG_REVERSE, FLAG_SUPPLEMENTARY, FLAG_UNMAPPED};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

/// Largest supported k-mer size (2-bit packed into a u64, capped like the
/// CLI contract).
pub const MAX_KMER_SIZE: usize = 28;

/// Seed votes required before a diagonal produces an alignment.
const MIN_SEED_VOTES: usize = 3;

/// Diagonal bucket width in bases.
const DIAG_BUCKET: i64 = 64;

fn encode_base(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// `(hash, position)` minimizers of one sequence.
fn minimizers(seq: &[u8], k: usize, w: usize) -> Vec<(u64, usize)> {
    if seq.len() < k {
        return Vec::new();
    }
    let mask = (1u64 << (2 * k)) - 1;
    let mut hashes: Vec<Option<u64>> = Vec::with_capacity(seq.len() - k + 1);
    let mut kmer = 0u64;
    let mut valid = 0usize;
    for (i, &base) in seq.iter().enumerate() {
        match encode_base(base) {
            Some(code) => {
                kmer = ((kmer << 2) | code) & mask;
                valid += 1;
            }
            None => {
                valid = 0;
            }
        }
        if i + 1 >= k {
            hashes.push(if valid >= k { Some(splitmix(kmer)) } else { None });
        }
    }

    let mut out = Vec::new();
    let mut last: Option<(u64, usize)> = None;
    for window_start in 0..hashes.len().saturating_sub(w - 1) {
        let window = &hashes[window_start..window_start + w];
        let best = window
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.map(|h| (h, window_start + i)))
            .min();
        if let Some(best) = best {
            if last != Some(best) {
                out.push(best);
                last = Some(best);
            }
        }
    }
    out
}

fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' | b'a' => b'T',
            b'C' | b'c' => b'G',
            b'G' | b'g' => b'C',
            b'T' | b't' => b'A',
            other => other,
        })
        .collect()
}

/// A minimizer index over a reference FASTA.
pub struct MinimizerIndex {
    k: usize,
    w: usize,
    target_names: Vec<String>,
    target_lens: Vec<usize>,
    seeds: AHashMap<u64, Vec<(u32, u32)>>,
}

impl MinimizerIndex {
    /// Build an index from a FASTA file.
    pub fn build(reference: &Path, k: usize, w: usize) -> Result<Self> {
        if k == 0 || k > MAX_KMER_SIZE {
            return Err(SquallError::InvalidParameter {
                parameter: "kmer_size".to_string(),
                reason: format!("must be between 1 and {MAX_KMER_SIZE}"),
            });
        }
        if w == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "window_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let file = std::fs::File::open(reference).map_err(|e| SquallError::InvalidFileFormat {
            file_type: "reference".to_string(),
            path: reference.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut targets: Vec<(String, Vec<u8>)> = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if let Some(name) = line.strip_prefix('>') {
                let name = name.split_whitespace().next().unwrap_or("").to_string();
                targets.push((name, Vec::new()));
            } else if let Some((_, seq)) = targets.last_mut() {
                seq.extend(line.trim().bytes());
            }
        }
        if targets.is_empty() {
            return Err(SquallError::InvalidFileFormat {
                file_type: "reference".to_string(),
                path: reference.display().to_string(),
                reason: "no FASTA records found".to_string(),
            });
        }

        let per_target: Vec<Vec<(u64, u32, u32)>> = targets
            .par_iter()
            .enumerate()
            .map(|(tid, (_, seq))| {
                minimizers(seq, k, w)
                    .into_iter()
                    .map(|(hash, pos)| (hash, tid as u32, pos as u32))
                    .collect()
            })
            .collect();

        let mut seeds: AHashMap<u64, Vec<(u32, u32)>> = AHashMap::new();
        for entries in per_target {
            for (hash, tid, pos) in entries {
                seeds.entry(hash).or_default().push((tid, pos));
            }
        }

        Ok(Self {
            k,
            w,
            target_names: targets.iter().map(|(n, _)| n.clone()).collect(),
            target_lens: targets.iter().map(|(_, s)| s.len()).collect(),
            seeds,
        })
    }

    /// Target `(name, length)` pairs for `@SQ` header lines.
    #[must_use]
    pub fn targets(&self) -> Vec<(String, usize)> {
        self.target_names
            .iter()
            .cloned()
            .zip(self.target_lens.iter().copied())
            .collect()
    }

    fn vote(&self, seq: &[u8]) -> AHashMap<(u32, i64), (usize, i64)> {
        let mut votes: AHashMap<(u32, i64), (usize, i64)> = AHashMap::new();
        for (hash, qpos) in minimizers(seq, self.k, self.w) {
            if let Some(hits) = self.seeds.get(&hash) {
                for &(tid, tpos) in hits {
                    let diag = i64::from(tpos) - qpos as i64;
                    let entry = votes.entry((tid, diag.div_euclid(DIAG_BUCKET))).or_insert((0, diag));
                    entry.0 += 1;
                    entry.1 = entry.1.min(diag);
                }
            }
        }
        votes
    }

    /// Align one record, producing primary plus supplementary records.
    ///
    /// Returns the input unchanged (still unmapped) when no diagonal gathers
    /// enough votes on either strand.
    #[must_use]
    pub fn align(&self, record: &SamRecord) -> Vec<SamRecord> {
        let forward = self.vote(&record.seq);
        let reverse = self.vote(&revcomp(&record.seq));

        let mut candidates: Vec<(usize, u32, i64, bool)> = Vec::new();
        for (&(tid, _), &(count, diag)) in &forward {
            candidates.push((count, tid, diag, false));
        }
        for (&(tid, _), &(count, diag)) in &reverse {
            candidates.push((count, tid, diag, true));
        }
        candidates.retain(|&(count, ..)| count >= MIN_SEED_VOTES);
        if candidates.is_empty() {
            let mut unmapped = record.clone();
            unmapped.flags |= FLAG_UNMAPPED;
            return vec![unmapped];
        }

        // Highest vote count wins; ties break on (target, diagonal) for
        // reproducibility.
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)).then(a.3.cmp(&b.3))
        });
        let best_votes = candidates[0].0;

        let mut records: Vec<SamRecord> = Vec::new();
        for (i, &(count, tid, diag, is_reverse)) in candidates.iter().enumerate() {
            if i > 0 && count * 2 < best_votes {
                break;
            }
            let mut aligned = record.clone();
            aligned.flags &= !FLAG_UNMAPPED;
            aligned.target = Some(self.target_names[tid as usize].clone());
            aligned.pos = diag.max(0) as usize;
            aligned.mapq = ((60 * count) / (best_votes + count)).min(60) as u8;
            aligned.cigar = format!("{}M", record.seq.len());
            if is_reverse {
                aligned.flags |= FLAG_REVERSE;
            }
            if i > 0 {
                aligned.flags |= FLAG_SUPPLEMENTARY;
            }
            records.push(aligned);
        }

        // Deterministic supplementary order behind the primary.
        records[1..].sort_by(|a, b| {
            a.target
                .cmp(&b.target)
                .then(a.pos.cmp(&b.pos))
                .then(a.cigar.cmp(&b.cigar))
        });
        records
    }
}

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    index: MinimizerIndex,
    num_records_aligned: AtomicU64,
    num_unmapped: AtomicU64,
}

impl Inner {
    fn worker_loop(&self) {
        while let Some(msg) = self.input.pop() {
            match msg {
                Message::SamRecord(record) => {
                    let aligned = self.index.align(&record);
                    if aligned[0].flags & FLAG_UNMAPPED != 0 {
                        self.num_unmapped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.num_records_aligned.fetch_add(1, Ordering::Relaxed);
                    }
                    for record in aligned {
                        send_to_sink(&self.sink, Message::SamRecord(Box::new(record)));
                    }
                }
                other => send_to_sink(&self.sink, other),
            }
        }
    }
}

/// Worker-pool node aligning records against a reference.
pub struct AlignerNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AlignerNode {
    #[must_use]
    pub fn new(
        sink: NodeHandle,
        index: MinimizerIndex,
        num_threads: usize,
        queue_capacity: usize,
    ) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                index,
                num_records_aligned: AtomicU64::new(0),
                num_unmapped: AtomicU64::new(0),
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
                    .name(format!("aligner_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn aligner thread"),
            );
        }
    }
}

impl PipelineNode for AlignerNode {
    fn name(&self) -> &'static str {
        "aligner"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_records_aligned".to_string(),
            self.inner.num_records_aligned.load(Ordering::Relaxed) as f64,
        );
        stats.insert("num_unmapped".to_string(), self.inner.num_unmapped.load(Ordering::Relaxed) as f64);
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
