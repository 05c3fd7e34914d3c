//! Runtime configuration and device parsing.

use std::path::PathBuf;

use crate::errors::{Result, SquallError};

/// A parsed compute device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Metal,
    /// CUDA ordinals to drive, one runner set per ordinal.
    Cuda(Vec<usize>),
}

impl Device {
    /// Number of distinct devices in this selection.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        match self {
            Device::Cpu | Device::Metal => 1,
            Device::Cuda(ordinals) => ordinals.len(),
        }
    }
}

/// Number of CUDA devices considered visible.
///
/// Real device discovery lives behind the runner boundary; the count honours
/// `CUDA_VISIBLE_DEVICES` when set and defaults to a single device.
#[must_use]
pub fn visible_cuda_devices() -> usize {
    std::env::var("CUDA_VISIBLE_DEVICES")
        .ok()
        .map_or(1, |v| v.split(',').filter(|s| !s.trim().is_empty()).count())
}

/// Parse a device string: `"cpu"`, `"metal"`, or `"cuda:<list|all>"`.
pub fn parse_device_string(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        "metal" => Ok(Device::Metal),
        _ => {
            let Some(spec) = device.strip_prefix("cuda:") else {
                return Err(SquallError::InvalidParameter {
                    parameter: "device".to_string(),
                    reason: format!("unsupported device string '{device}'"),
                });
            };
            let ordinals = if spec == "all" {
                (0..visible_cuda_devices()).collect()
            } else {
                spec.split(',')
                    .map(|s| {
                        s.trim().parse::<usize>().map_err(|_| SquallError::InvalidParameter {
                            parameter: "device".to_string(),
                            reason: format!("bad CUDA ordinal '{s}' in '{device}'"),
                        })
                    })
                    .collect::<Result<Vec<usize>>>()?
            };
            if ordinals.is_empty() {
                return Err(SquallError::DeviceUnavailable {
                    device: device.to_string(),
                    reason: "no CUDA devices selected".to_string(),
                });
            }
            Ok(Device::Cuda(ordinals))
        }
    }
}

/// Pluggable batch-size calibration for `batch_size == 0`.
pub type AutoBatchSize = fn(&std::path::Path, &Device) -> usize;

/// Default calibration: hardware concurrency on CPU, a fixed conservative
/// value on GPU devices.
#[must_use]
pub fn default_auto_batch_size(_model_path: &std::path::Path, device: &Device) -> usize {
    match device {
        Device::Cpu => std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
        Device::Metal | Device::Cuda(_) => 384,
    }
}

/// The full runtime configuration surface.
#[derive(Debug, Clone)]
pub struct BasecallConfig {
    pub model_path: PathBuf,
    pub data_path: PathBuf,
    pub recursive: bool,
    pub device: String,
    pub chunk_size: usize,
    pub overlap: usize,
    /// 0 means auto-calibrate via `auto_batch_size`.
    pub batch_size: usize,
    pub num_runners: usize,
    pub modified_bases_models: Vec<PathBuf>,
    pub remora_batch_size: usize,
    pub num_remora_threads: usize,
    pub emit_fastq: bool,
    pub emit_moves: bool,
    pub min_qscore: f32,
    /// 0 means unlimited.
    pub max_reads: usize,
    pub read_list_file_path: Option<PathBuf>,
    pub reference: Option<PathBuf>,
    pub kmer_size: usize,
    pub window_size: usize,
    pub auto_batch_size: AutoBatchSize,
}

impl Default for BasecallConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            data_path: PathBuf::new(),
            recursive: false,
            device: "cpu".to_string(),
            chunk_size: 4000,
            overlap: 500,
            batch_size: 0,
            num_runners: 2,
            modified_bases_models: Vec::new(),
            remora_batch_size: 1024,
            num_remora_threads: 4,
            emit_fastq: false,
            emit_moves: false,
            min_qscore: 0.0,
            max_reads: 0,
            read_list_file_path: None,
            reference: None,
            kmer_size: 15,
            window_size: 10,
            auto_batch_size: default_auto_batch_size,
        }
    }
}

impl BasecallConfig {
    /// Validate cross-option constraints before any worker spawns.
    pub fn validate(&self) -> Result<()> {
        if !self.modified_bases_models.is_empty() && self.emit_fastq {
            return Err(SquallError::InvalidParameter {
                parameter: "modified-bases-models".to_string(),
                reason: "modified base models cannot be used with FASTQ output".to_string(),
            });
        }
        if self.reference.is_some() && self.emit_fastq {
            return Err(SquallError::InvalidParameter {
                parameter: "ref".to_string(),
                reason: "alignment to a reference cannot be used with FASTQ output".to_string(),
            });
        }
        if self.overlap >= self.chunk_size {
            return Err(SquallError::InvalidParameter {
                parameter: "overlap".to_string(),
                reason: format!(
                    "{} must be smaller than the chunk size {}",
                    self.overlap, self.chunk_size
                ),
            });
        }
        if self.kmer_size == 0 || self.kmer_size > crate::aligner::MAX_KMER_SIZE {
            return Err(SquallError::InvalidParameter {
                parameter: "kmer_size".to_string(),
                reason: format!("must be between 1 and {}", crate::aligner::MAX_KMER_SIZE),
            });
        }
        if self.num_runners == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "num_runners".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        parse_device_string(&self.device).map(|_| ())
    }

    /// The effective batch size for `device`, calibrating when 0.
    #[must_use]
    pub fn effective_batch_size(&self, device: &Device) -> usize {
        if self.batch_size > 0 {
            self.batch_size
        } else {
            (self.auto_batch_size)(&self.model_path, device).max(1)
        }
    }
}
