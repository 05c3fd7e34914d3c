//! The `basecaller` command: build the pipeline bottom-up, stream the data
//! directory through it, and report statistics.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::command::Command;
use crate::version::VERSION;
use squall_lib::aligner::{AlignerNode, MinimizerIndex};
use squall_lib::basecaller::BasecallerNode;
use squall_lib::config::{parse_device_string, BasecallConfig, Device};
use squall_lib::data_loader::{get_num_reads, load_read_groups, load_read_list, DataLoader};
use squall_lib::logging::{log_pipeline_summary, OperationTimer};
use squall_lib::modbase::{ModBaseCallerNode, RemoraCaller, RemoraParams};
use squall_lib::node::{FlushOptions, NodeHandle, Pipeline, PipelineDescriptor};
use squall_lib::read_filter::ReadFilterNode;
use squall_lib::read_to_bam::ReadToBamTypeNode;
use squall_lib::runner::{CpuRunner, CudaRunner, MetalRunner, Runner, RunnerParams};
use squall_lib::sam::build_header;
use squall_lib::scaler::ScalerNode;
use squall_lib::stats::StatsSampler;
use squall_lib::writer::{OutputMode, WriterNode};

/// Inbound queue capacity for every node.
const QUEUE_CAPACITY: usize = 10_000;

/// Batch timeout for the basecaller and modbase stages.
const BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Leading samples trimmed from every signal before scaling.
const SIGNAL_TRIM_SAMPLES: usize = 10;

/// Run the basecaller over a directory of signal files.
#[derive(Parser, Debug)]
pub struct Basecaller {
    /// The basecaller model directory to run.
    model: PathBuf,

    /// The data directory to scan for signal files.
    data: PathBuf,

    /// Device string: "cpu", "metal", "cuda:all", or "cuda:<n>[,<n>...]".
    #[clap(short = 'x', long, default_value = "cpu")]
    device: String,

    /// A file with a newline-delimited list of reads to basecall.
    #[clap(short = 'l', long = "read-ids")]
    read_ids: Option<PathBuf>,

    /// Limit the number of reads to basecall (0 = unlimited).
    #[clap(short = 'n', long, default_value_t = 0)]
    max_reads: usize,

    /// Drop reads whose mean quality falls below this threshold.
    #[clap(long, default_value_t = 0.0)]
    min_qscore: f32,

    /// Chunk batch size; 0 selects an optimal batch size automatically.
    #[clap(short = 'b', long = "batchsize", default_value_t = 0)]
    batch_size: usize,

    /// Chunk length in samples.
    #[clap(short = 'c', long = "chunksize", default_value_t = 4000)]
    chunk_size: usize,

    /// Overlap between adjacent chunks, in samples.
    #[clap(short = 'o', long, default_value_t = 500)]
    overlap: usize,

    /// Recursively scan the data directory for signal files.
    #[clap(short = 'r', long)]
    recursive: bool,

    /// Comma-separated list of modified base model directories.
    #[clap(long = "modified-bases-models", value_delimiter = ',')]
    modified_bases_models: Vec<PathBuf>,

    /// Batch size for modified base calling.
    #[clap(long, default_value_t = 1024)]
    remora_batch_size: usize,

    /// Worker threads for modified base calling.
    #[clap(long, default_value_t = 4)]
    num_remora_threads: usize,

    /// Runners per device.
    #[clap(long, default_value_t = 2)]
    num_runners: usize,

    /// Emit FASTQ instead of SAM records.
    #[clap(long)]
    emit_fastq: bool,

    /// Write the move table to the mv tag.
    #[clap(long)]
    emit_moves: bool,

    /// Path to a reference FASTA for alignment.
    #[clap(long = "ref")]
    reference: Option<PathBuf>,

    /// Minimizer k-mer size (maximum 28).
    #[clap(short = 'k', default_value_t = 15)]
    kmer_size: usize,

    /// Minimizer window size.
    #[clap(short = 'w', default_value_t = 10)]
    window_size: usize,

    /// Verbose (debug) logging.
    #[clap(short = 'v', long)]
    verbose: bool,
}

impl Basecaller {
    fn to_config(&self) -> BasecallConfig {
        BasecallConfig {
            model_path: self.model.clone(),
            data_path: self.data.clone(),
            recursive: self.recursive,
            device: self.device.clone(),
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            batch_size: self.batch_size,
            num_runners: self.num_runners,
            modified_bases_models: self.modified_bases_models.clone(),
            remora_batch_size: self.remora_batch_size,
            num_remora_threads: self.num_remora_threads,
            emit_fastq: self.emit_fastq,
            emit_moves: self.emit_moves,
            min_qscore: self.min_qscore,
            max_reads: self.max_reads,
            read_list_file_path: self.read_ids.clone(),
            reference: self.reference.clone(),
            kmer_size: self.kmer_size,
            window_size: self.window_size,
            ..BasecallConfig::default()
        }
    }
}

fn build_runners(config: &BasecallConfig, device: &Device) -> Result<Vec<Runner>> {
    let batch_size = config.effective_batch_size(device);
    debug!("selected batchsize {batch_size}");
    let params = RunnerParams::load(&config.model_path, config.chunk_size, batch_size)?;
    if params.chunk_size != config.chunk_size {
        debug!(
            "adjusted chunk size to match model stride: {} -> {}",
            config.chunk_size, params.chunk_size
        );
    }

    let mut runners = Vec::new();
    match device {
        Device::Cpu => {
            for _ in 0..config.num_runners {
                runners.push(Runner::Cpu(CpuRunner::new(params.clone())));
            }
        }
        Device::Metal => {
            for _ in 0..config.num_runners {
                runners.push(Runner::Metal(MetalRunner::new(params.clone())));
            }
        }
        Device::Cuda(ordinals) => {
            let visible = squall_lib::config::visible_cuda_devices();
            for &ordinal in ordinals {
                for _ in 0..config.num_runners {
                    runners.push(Runner::Cuda(CudaRunner::new(params.clone(), ordinal, visible)?));
                }
            }
        }
    }
    Ok(runners)
}

fn build_remora_callers(config: &BasecallConfig, device: &Device) -> Result<Vec<RemoraCaller>> {
    let mut callers = Vec::new();
    for model_path in &config.modified_bases_models {
        let params = RemoraParams::load(model_path)?;
        match device {
            Device::Cuda(ordinals) => {
                for &ordinal in ordinals {
                    callers.push(RemoraCaller::new(
                        params.clone(),
                        Some(ordinal),
                        config.remora_batch_size,
                    ));
                }
            }
            Device::Cpu | Device::Metal => {
                callers.push(RemoraCaller::new(params.clone(), None, config.remora_batch_size));
            }
        }
    }
    Ok(callers)
}

fn run(config: &BasecallConfig, command_line: &str) -> Result<()> {
    config.validate()?;
    let device = parse_device_string(&config.device)?;
    let num_devices = device.num_devices();

    info!("> Creating basecall pipeline");
    let runners = build_runners(config, &device)?;
    let model_stride = runners[0].model_stride();
    let model_name = runners[0].model_name().to_string();
    let remora_callers = build_remora_callers(config, &device)?;

    let read_groups = load_read_groups(&config.data_path, &model_name)?;
    let read_group_id = read_groups.keys().next().cloned().unwrap_or_default();
    let read_list = load_read_list(config.read_list_file_path.as_deref())?;
    let num_reads =
        get_num_reads(&config.data_path, read_list.as_ref(), config.max_reads, config.recursive)?;
    info!("> {num_reads} reads to basecall");

    let mut header = build_header(VERSION, command_line, &read_groups);

    // Leaves first: every constructor holds its sink.
    let mut desc = PipelineDescriptor::new();
    let mode = if config.emit_fastq { OutputMode::Fastq } else { OutputMode::Sam };
    let writer =
        Arc::new(WriterNode::new("-", mode, 2 * num_devices, QUEUE_CAPACITY).context("opening output")?);
    desc.add_node(writer.clone());

    let converted_sink: NodeHandle = if let Some(reference) = &config.reference {
        let index = MinimizerIndex::build(reference, config.kmer_size, config.window_size)?;
        for (i, (name, len)) in index.targets().into_iter().enumerate() {
            header.insert(1 + i, format!("@SQ\tSN:{name}\tLN:{len}"));
        }
        desc.add_node(Arc::new(AlignerNode::new(
            writer.clone(),
            index,
            5 * num_devices,
            QUEUE_CAPACITY,
        )))
    } else {
        writer.clone()
    };
    writer.write_header(&header)?;

    let converter = desc.add_node(Arc::new(ReadToBamTypeNode::new(
        converted_sink,
        config.emit_moves,
        2 * num_devices,
        QUEUE_CAPACITY,
    )));
    let filter = desc.add_node(Arc::new(ReadFilterNode::new(
        converter,
        config.min_qscore,
        2 * num_devices,
        QUEUE_CAPACITY,
    )));

    let basecaller_sink: NodeHandle = if remora_callers.is_empty() {
        filter
    } else {
        desc.add_node(Arc::new(ModBaseCallerNode::new(
            filter,
            remora_callers,
            config.num_remora_threads,
            BATCH_TIMEOUT,
            QUEUE_CAPACITY,
        )?))
    };

    let basecaller = desc.add_node(Arc::new(BasecallerNode::new(
        basecaller_sink,
        runners,
        config.overlap,
        BATCH_TIMEOUT,
        QUEUE_CAPACITY,
    )?));
    let scaler = desc.add_node(Arc::new(ScalerNode::new(
        basecaller,
        4 * num_devices,
        SIGNAL_TRIM_SAMPLES,
        QUEUE_CAPACITY,
    )));

    let pipeline = Pipeline::create(desc);
    let sampler = StatsSampler::start(pipeline.nodes().to_vec(), Duration::from_secs(1));

    let loader = DataLoader::new(
        scaler,
        model_stride,
        read_group_id,
        read_list,
        config.max_reads,
    );
    let timer = OperationTimer::new("Basecalling");
    let loaded = loader.load_reads(&config.data_path, config.recursive)?;

    pipeline.terminate(&FlushOptions::default());
    timer.log_completion(loaded as u64);
    let stats = sampler.stop();
    log_pipeline_summary(&stats);
    Ok(())
}

impl Command for Basecaller {
    fn execute(&self, command_line: &str) -> Result<()> {
        if self.verbose {
            debug!("verbose logging enabled");
        }
        let config = self.to_config();
        run(&config, command_line)
    }
}
