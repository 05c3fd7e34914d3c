//! The output writer, terminal join-point of the pipeline.
//!
//! Workers claim a record and a write slot in one atomic step, serialize in
//! parallel, and hand the text to a reorder buffer that releases slots to
//! the output stream strictly in claim order. Records therefore reach the
//! stream in input order even with a multi-threaded pool, which is what
//! keeps a primary record ahead of its supplementaries.
//!
//! Serialization failures are logged, counted, and dropped; they never
//! propagate upstream. `write_header` must be called before any record
//! arrives. Supplementary records are skipped in FASTQ mode, which has no
//! way to express them.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::Message;
use crate::node::{FlushOptions, PipelineNode};
use crate::sam::{SamRecord, FLAG_SUPPLEMENTARY};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

/// Output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// SAM text with header and tags.
    Sam,
    /// Sequence and qualities only.
    Fastq,
}

/// Serialized records waiting for their turn on the stream.
///
/// `None` marks a claimed slot with nothing to write (a dropped record or a
/// non-record message); the slot still advances `next_write`.
struct ReorderState {
    pending: BTreeMap<u64, Option<String>>,
    next_write: u64,
}

struct Inner {
    input: WorkQueue<Message>,
    out: Mutex<Box<dyn Write + Send>>,
    mode: OutputMode,
    header_written: AtomicBool,
    /// Next sequence number to claim; guards the pop+claim pair.
    pop_seq: Mutex<u64>,
    reorder: Mutex<ReorderState>,
    num_records_received: AtomicU64,
    num_records_written: AtomicU64,
    num_write_errors: AtomicU64,
    num_supplementary_skipped: AtomicU64,
}

impl Inner {
    fn serialize(&self, record: &SamRecord) -> Result<String> {
        match self.mode {
            OutputMode::Sam => record.to_sam_line().map(|mut line| {
                line.push('\n');
                line
            }),
            OutputMode::Fastq => record.to_fastq_block(),
        }
    }

    fn worker_loop(&self) {
        loop {
            // Claim the record and its write slot atomically so parallel
            // serialization cannot reorder records of one read.
            let (seq, msg) = {
                let mut next_seq = self.pop_seq.lock();
                let Some(msg) = self.input.pop() else {
                    return;
                };
                let seq = *next_seq;
                *next_seq += 1;
                (seq, msg)
            };

            let text = match msg {
                Message::SamRecord(record) => {
                    self.num_records_received.fetch_add(1, Ordering::Relaxed);
                    if self.mode == OutputMode::Fastq
                        && record.flags & FLAG_SUPPLEMENTARY != 0
                    {
                        self.num_supplementary_skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    } else {
                        match self.serialize(&record) {
                            Ok(text) => Some(text),
                            Err(e) => {
                                log::warn!("dropping unserializable record: {e}");
                                self.num_write_errors.fetch_add(1, Ordering::Relaxed);
                                None
                            }
                        }
                    }
                }
                // The writer is terminal; anything else has nowhere to go.
                _ => None,
            };
            self.write_in_order(seq, text);
        }
    }

    /// Park a serialized slot and flush every slot that is now ready.
    fn write_in_order(&self, seq: u64, text: Option<String>) {
        let mut reorder = self.reorder.lock();
        let state = &mut *reorder;
        state.pending.insert(seq, text);
        while let Some(slot) = state.pending.remove(&state.next_write) {
            state.next_write += 1;
            let Some(text) = slot else {
                continue;
            };
            let mut out = self.out.lock();
            if let Err(e) = out.write_all(text.as_bytes()) {
                log::error!("write failed: {e}");
                self.num_write_errors.fetch_add(1, Ordering::Relaxed);
            } else {
                self.num_records_written.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The terminal writer node.
pub struct WriterNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriterNode {
    /// Open a writer for `destination` (`"-"` for stdout).
    pub fn new(
        destination: &str,
        mode: OutputMode,
        num_threads: usize,
        queue_capacity: usize,
    ) -> Result<Self> {
        let out: Box<dyn Write + Send> = if destination == "-" {
            Box::new(std::io::BufWriter::new(std::io::stdout()))
        } else {
            Box::new(std::io::BufWriter::new(std::fs::File::create(destination)?))
        };
        Ok(Self::with_output(out, mode, num_threads, queue_capacity))
    }

    /// Build a writer over an arbitrary stream (used by tests).
    #[must_use]
    pub fn with_output(
        out: Box<dyn Write + Send>,
        mode: OutputMode,
        num_threads: usize,
        queue_capacity: usize,
    ) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                out: Mutex::new(out),
                mode,
                header_written: AtomicBool::new(false),
                pop_seq: Mutex::new(0),
                reorder: Mutex::new(ReorderState { pending: BTreeMap::new(), next_write: 0 }),
                num_records_received: AtomicU64::new(0),
                num_records_written: AtomicU64::new(0),
                num_write_errors: AtomicU64::new(0),
                num_supplementary_skipped: AtomicU64::new(0),
            }),
            num_threads: num_threads.max(1),
            workers: Mutex::new(Vec::new()),
        };
        node.start_workers();
        node
    }

    /// Write the header lines. Must precede every record; only SAM output
    /// carries a header.
    pub fn write_header(&self, lines: &[String]) -> Result<()> {
        if self.inner.header_written.swap(true, Ordering::SeqCst) {
            return Err(SquallError::InvalidParameter {
                parameter: "header".to_string(),
                reason: "header already written".to_string(),
            });
        }
        if self.inner.mode == OutputMode::Sam {
            let mut out = self.inner.out.lock();
            for line in lines {
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    /// Drain the queue, join the workers, and flush the stream.
    pub fn join(&self) {
        self.terminate(&FlushOptions::default());
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock();
        for i in 0..self.num_threads {
            let inner = Arc::clone(&self.inner);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("writer_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn writer thread"),
            );
        }
    }
}

impl PipelineNode for WriterNode {
    fn name(&self) -> &'static str {
        "writer"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_records_received".to_string(),
            self.inner.num_records_received.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "num_records_written".to_string(),
            self.inner.num_records_written.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "num_write_errors".to_string(),
            self.inner.num_write_errors.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "num_supplementary_skipped".to_string(),
            self.inner.num_supplementary_skipped.load(Ordering::Relaxed) as f64,
        );
        stats.insert("work_queue_depth".to_string(), self.inner.input.len() as f64);
        stats
    }

    fn terminate(&self, flush: &FlushOptions) {
        self.inner.input.terminate();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        debug_assert!(self.inner.reorder.lock().pending.is_empty());
        if flush.wait_for_idle {
            if let Err(e) = self.inner.out.lock().flush() {
                log::error!("flushing output failed: {e}");
            }
        }
    }

    fn restart(&self) {
        self.inner.input.restart();
        self.start_workers();
    }
}
