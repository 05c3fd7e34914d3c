//! Inference runners.
//!
//! A [`Runner`] is one inference engine instance bound to one device. The
//! three realizations (CPU, CUDA, Metal) share the scoring kernel and the
//! decoder and differ only in how chunks are staged and how the batched call
//! executes: GPU-backed runners serialize calls on the same device through a
//! fixed array of per-device mutexes, since one device must never be driven
//! from two lanes at once.
//!
//! Runners never own reads. They operate on signal views staged into their
//! batch tensor via [`Runner::accept_chunk`]; the caller guarantees the view
//! is valid until [`Runner::call_chunks`] returns.

use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;

use crate::decode::{decode_steps, DecodedChunk};
use crate::errors::{Result, SquallError};

/// Upper bound on distinct GPU devices; ample for one host.
const NUM_DEVICE_MUTEXES: usize = 32;

/// One mutex per device ordinal; lanes sharing a device serialize here.
static DEVICE_MUTEXES: [Mutex<()>; NUM_DEVICE_MUTEXES] =
    [const { Mutex::new(()) }; NUM_DEVICE_MUTEXES];

/// Serialize access to one device across runner lanes and modbase callers.
pub(crate) fn device_lock(ordinal: usize) -> parking_lot::MutexGuard<'static, ()> {
    DEVICE_MUTEXES[ordinal % NUM_DEVICE_MUTEXES].lock()
}

#[derive(Debug, Deserialize)]
struct ModelToml {
    model: ModelSection,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    stride: usize,
    #[allow(dead_code)]
    name: Option<String>,
}

/// Model parameters shared by all runners of one model.
#[derive(Debug, Clone)]
pub struct RunnerParams {
    /// Model name, taken from the model directory's file name.
    pub model_name: String,
    /// Samples-per-base ratio.
    pub stride: usize,
    /// Chunk length in samples; always a stride multiple.
    pub chunk_size: usize,
    /// Number of chunk slots per batch.
    pub batch_size: usize,
}

impl RunnerParams {
    /// Load model parameters from `<model_path>/model.toml`, adjusting the
    /// requested chunk size down to a stride multiple.
    pub fn load(model_path: &Path, chunk_size: usize, batch_size: usize) -> Result<Self> {
        let toml_path = model_path.join("model.toml");
        let text = std::fs::read_to_string(&toml_path).map_err(|e| SquallError::InvalidFileFormat {
            file_type: "model".to_string(),
            path: toml_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let parsed: ModelToml = toml::from_str(&text).map_err(|e| SquallError::InvalidFileFormat {
            file_type: "model".to_string(),
            path: toml_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let model_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(model_name, parsed.model.stride, chunk_size, batch_size)
    }

    /// Build parameters directly, adjusting `chunk_size` to a stride multiple.
    pub fn new(
        model_name: String,
        stride: usize,
        chunk_size: usize,
        batch_size: usize,
    ) -> Result<Self> {
        if stride == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "stride".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let adjusted = (chunk_size / stride) * stride;
        if adjusted == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "chunk_size".to_string(),
                reason: format!("{chunk_size} is smaller than the model stride {stride}"),
            });
        }
        if batch_size == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self { model_name, stride, chunk_size: adjusted, batch_size })
    }
}

/// Scores for one executed batch, slot-major.
#[derive(Debug)]
pub struct ScoreBatch {
    steps: usize,
    scores: Vec<f32>,
}

impl ScoreBatch {
    /// Per-step scores for one batch slot.
    #[must_use]
    pub fn slot(&self, slot: usize) -> &[f32] {
        &self.scores[slot * self.steps..(slot + 1) * self.steps]
    }
}

/// The shared scoring core: a batch tensor plus the kernel over it.
#[derive(Debug)]
pub struct CpuRunner {
    params: RunnerParams,
    batch: Vec<f32>,
}

impl CpuRunner {
    #[must_use]
    pub fn new(params: RunnerParams) -> Self {
        let batch = vec![0.0; params.batch_size * params.chunk_size];
        Self { params, batch }
    }

    fn accept_chunk(&mut self, slot: usize, signal: &[f32]) {
        assert!(slot < self.params.batch_size, "batch slot out of range");
        assert_eq!(signal.len(), self.params.chunk_size, "chunk length mismatch");
        let offset = slot * self.params.chunk_size;
        self.batch[offset..offset + self.params.chunk_size].copy_from_slice(signal);
    }

    fn call_chunks(&mut self, count: usize) -> Result<ScoreBatch> {
        assert!(count <= self.params.batch_size, "batch fill out of range");
        let stride = self.params.stride;
        let steps = self.params.chunk_size / stride;
        let mut scores = Vec::with_capacity(count * steps);
        for slot in 0..count {
            let row = &self.batch[slot * self.params.chunk_size..(slot + 1) * self.params.chunk_size];
            if row.iter().any(|v| !v.is_finite()) {
                return Err(SquallError::RunnerFailure {
                    runner: self.params.model_name.clone(),
                    reason: "non-finite sample in batch tensor".to_string(),
                });
            }
            for step in 0..steps {
                let window = &row[step * stride..(step + 1) * stride];
                let mean: f32 = window.iter().sum::<f32>() / stride as f32;
                scores.push(mean);
            }
        }
        Ok(ScoreBatch { steps, scores })
    }
}

/// A runner bound to one CUDA ordinal.
#[derive(Debug)]
pub struct CudaRunner {
    ordinal: usize,
    inner: CpuRunner,
}

impl CudaRunner {
    pub fn new(params: RunnerParams, ordinal: usize, visible_devices: usize) -> Result<Self> {
        if ordinal >= visible_devices {
            return Err(SquallError::DeviceUnavailable {
                device: format!("cuda:{ordinal}"),
                reason: format!("only {visible_devices} device(s) visible"),
            });
        }
        Ok(Self { ordinal, inner: CpuRunner::new(params) })
    }
}

/// A runner bound to the Metal device.
#[derive(Debug)]
pub struct MetalRunner {
    inner: CpuRunner,
}

impl MetalRunner {
    #[must_use]
    pub fn new(params: RunnerParams) -> Self {
        Self { inner: CpuRunner::new(params) }
    }
}

/// Value-level dispatch over the runner realizations.
///
/// Runners are moved across threads at startup (one lane owns one runner),
/// so a plain enum is used instead of trait objects.
#[derive(Debug)]
pub enum Runner {
    Cpu(CpuRunner),
    Cuda(CudaRunner),
    Metal(MetalRunner),
}

impl Runner {
    fn core(&self) -> &CpuRunner {
        match self {
            Runner::Cpu(r) => r,
            Runner::Cuda(r) => &r.inner,
            Runner::Metal(r) => &r.inner,
        }
    }

    fn core_mut(&mut self) -> &mut CpuRunner {
        match self {
            Runner::Cpu(r) => r,
            Runner::Cuda(r) => &mut r.inner,
            Runner::Metal(r) => &mut r.inner,
        }
    }

    /// Samples-per-base ratio of the loaded model.
    #[must_use]
    pub fn model_stride(&self) -> usize {
        self.core().params.stride
    }

    /// Chunk size after stride adjustment; the first runner's value is
    /// authoritative for the whole pipeline.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.core().params.chunk_size
    }

    /// Number of chunk slots per batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.core().params.batch_size
    }

    /// Model name for logs and stats.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.core().params.model_name
    }

    /// Stage a chunk into the pending batch at `slot`.
    pub fn accept_chunk(&mut self, slot: usize, signal: &[f32]) {
        self.core_mut().accept_chunk(slot, signal);
    }

    /// Execute inference over the first `count` staged slots. May block.
    pub fn call_chunks(&mut self, count: usize) -> Result<ScoreBatch> {
        match self {
            Runner::Cpu(r) => r.call_chunks(count),
            Runner::Cuda(r) => {
                let _device = device_lock(r.ordinal);
                r.inner.call_chunks(count)
            }
            Runner::Metal(r) => {
                let _device = device_lock(0);
                r.inner.call_chunks(count)
            }
        }
    }

    /// Decode one slot of a score batch into a sequence fragment.
    #[must_use]
    pub fn decode(&self, scores: &ScoreBatch, slot: usize) -> DecodedChunk {
        decode_steps(scores.slot(slot))
    }
}
