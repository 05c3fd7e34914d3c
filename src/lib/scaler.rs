//! Signal normalization.
//!
//! For each read the scaler computes a shift and scale from the raw 16-bit
//! signal (median and median absolute deviation) and produces
//! `scaled_signal = (raw - shift) / scale` as floats. A configured number of
//! leading samples is trimmed first, and the tail is truncated to a stride
//! multiple so every downstream per-stride structure divides evenly.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::{Message, ReadCommon};
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::stats::NamedStats;
use crate::work_queue::WorkQueue;

/// Median of a float slice. Returns 0.0 for an empty slice.
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    values.sort_unstable_by(|a, b| a.partial_cmp(b).expect("signal values are finite"));
    values[mid]
}

/// Median/MAD normalization parameters for one signal.
#[must_use]
pub fn med_mad(raw: &[i16]) -> (f32, f32) {
    let mut values: Vec<f32> = raw.iter().map(|&v| f32::from(v)).collect();
    let shift = median(&mut values);
    for v in &mut values {
        *v = (*v - shift).abs();
    }
    let mut scale = median(&mut values);
    if scale < 1e-9 {
        scale = 1.0;
    }
    (shift, scale)
}

/// Normalize one read in place.
pub fn scale_read(common: &mut ReadCommon, trim_samples: usize) {
    let trim = trim_samples.min(common.raw_signal.len());
    let body = &common.raw_signal[trim..];
    let (shift, scale) = med_mad(body);

    let stride = common.model_stride.max(1);
    let keep = (body.len() / stride) * stride;
    common.scaled_signal =
        body[..keep].iter().map(|&v| (f32::from(v) - shift) / scale).collect();
    common.num_trimmed_samples = trim;
}

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    trim_samples: usize,
    num_reads_scaled: AtomicU64,
}

impl Inner {
    fn worker_loop(&self) {
        while let Some(mut msg) = self.input.pop() {
            if let Some(common) = msg.read_common_mut() {
                scale_read(common, self.trim_samples);
                self.num_reads_scaled.fetch_add(1, Ordering::Relaxed);
            }
            send_to_sink(&self.sink, msg);
        }
    }
}

/// Worker-pool node normalizing raw signal.
pub struct ScalerNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScalerNode {
    #[must_use]
    pub fn new(sink: NodeHandle, num_threads: usize, trim_samples: usize, queue_capacity: usize) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                trim_samples,
                num_reads_scaled: AtomicU64::new(0),
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
                    .name(format!("scaler_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn scaler thread"),
            );
        }
    }
}

impl PipelineNode for ScalerNode {
    fn name(&self) -> &'static str {
        "scaler"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_reads_scaled".to_string(),
            self.inner.num_reads_scaled.load(Ordering::Relaxed) as f64,
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
