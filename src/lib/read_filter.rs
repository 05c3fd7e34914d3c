//! Quality filtering.
//!
//! Drops reads whose arithmetic-mean phred quality falls below the
//! configured threshold, or whose sequence is empty. Stateless across reads.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::Message;
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    min_qscore: f32,
    num_filtered: AtomicU64,
    num_forwarded: AtomicU64,
}

impl Inner {
    fn worker_loop(&self) {
        while let Some(msg) = self.input.pop() {
            let drop_read = msg
                .read_common()
                .is_some_and(|c| c.seq.is_empty() || c.mean_qscore() < self.min_qscore);
            if drop_read {
                self.num_filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.num_forwarded.fetch_add(1, Ordering::Relaxed);
            send_to_sink(&self.sink, msg);
        }
    }
}

/// Quality-threshold filter node.
pub struct ReadFilterNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadFilterNode {
    #[must_use]
    pub fn new(sink: NodeHandle, min_qscore: f32, num_threads: usize, queue_capacity: usize) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                min_qscore,
                num_filtered: AtomicU64::new(0),
                num_forwarded: AtomicU64::new(0),
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
                    .name(format!("read_filter_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn read filter thread"),
            );
        }
    }
}

impl PipelineNode for ReadFilterNode {
    fn name(&self) -> &'static str {
        "read_filter"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("num_filtered".to_string(), self.inner.num_filtered.load(Ordering::Relaxed) as f64);
        stats.insert(
            "num_forwarded".to_string(),
            self.inner.num_forwarded.load(Ordering::Relaxed) as f64,
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
