//! Shared fixtures for pipeline integration tests.

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use squall_lib::errors::{Result, SquallError};
use squall_lib::messages::{Message, SimplexRead};
use squall_lib::node::{FlushOptions, PipelineNode};
use squall_lib::runner::{CpuRunner, Runner, RunnerParams};
use squall_lib::stats::NamedStats;
use squall_lib::work_queue::WorkQueue;

/// A terminal sink that keeps every message it receives, optionally
/// sleeping per message to simulate a slow consumer.
pub struct CaptureSink {
    queue: WorkQueue<Message>,
    pub messages: Mutex<Vec<Message>>,
    delay: Option<Duration>,
}

impl CaptureSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: WorkQueue::new(capacity),
            messages: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn slow(capacity: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: WorkQueue::new(capacity),
            messages: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    fn drain(&self) {
        while let Some(msg) = self.queue.try_pop() {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.messages.lock().push(msg);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl PipelineNode for CaptureSink {
    fn name(&self) -> &'static str {
        "capture_sink"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.queue.push(msg).map_err(|_| SquallError::QueueTerminated)?;
        self.drain();
        Ok(())
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("num_messages".to_string(), self.messages.lock().len() as f64);
        stats.insert("work_queue_depth".to_string(), self.queue.len() as f64);
        stats
    }

    fn terminate(&self, _flush: &FlushOptions) {
        self.queue.terminate();
        self.drain();
    }

    fn restart(&self) {
        self.queue.restart();
    }
}

/// A `Write` sink over shared memory so writer output can be inspected.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().clone()).expect("writer output is UTF-8")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A deterministic CPU runner for the given geometry.
pub fn cpu_runner(stride: usize, chunk_size: usize, batch_size: usize) -> Runner {
    let params =
        RunnerParams::new("itest_model".to_string(), stride, chunk_size, batch_size).unwrap();
    Runner::Cpu(CpuRunner::new(params))
}

/// A raw read with a deterministic wavy signal.
pub fn raw_read(id: &str, num_samples: usize) -> Message {
    let mut read = SimplexRead::default();
    read.common.read_id = id.to_string();
    read.common.raw_signal =
        (0..num_samples).map(|i| (((i / 30) % 40) as i16 - 20) * 12 + 400).collect();
    read.common.model_stride = 5;
    read.common.rna_poly_tail_length = -1;
    Message::SimplexRead(Box::new(read))
}

/// Popcount of a move table.
pub fn move_popcount(moves: &[u8]) -> usize {
    moves.iter().map(|&m| usize::from(m)).sum()
}
