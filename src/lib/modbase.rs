//! Modified-base calling.
//!
//! Structurally a smaller sibling of the basecaller: already-basecalled
//! reads are split into per-base signal windows, the windows are batched per
//! modification model and scored by per-device [`RemoraCaller`]s, and the
//! per-site probabilities are reassembled into the read's `base_mod_probs`
//! buffer. A read leaves this node carrying a probability for every channel
//! at every base position, zero-filled where no site applies.
//!
//! Batch staging goes through a pre-allocated [`MemoryManager`] slab pool
//! sized to the number of caller lanes; GPU-backed callers serialize per
//! device the same way runners do.

use parking_lot::Mutex;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::errors::{Result, SquallError};
use crate::memory::MemoryManager;
use crate::messages::{Message, ModBaseInfo};
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::stats::NamedStats;
use crate::work_queue::{PopResult, WorkQueue};

#[derive(Debug, Deserialize)]
struct ModBaseToml {
    modbase: ModBaseSection,
}

#[derive(Debug, Deserialize)]
struct ModBaseSection {
    alphabet: String,
    canonical: String,
    context_samples: usize,
}

/// Parameters of one modification model.
#[derive(Debug, Clone)]
pub struct RemoraParams {
    /// Model name, from the model directory's file name.
    pub model_name: String,
    /// Modification channel codes, e.g. `"hm"`.
    pub alphabet: String,
    /// Canonical base the model targets, e.g. `b'C'`.
    pub canonical: u8,
    /// Signal window length per site, in samples.
    pub context_samples: usize,
}

impl RemoraParams {
    /// Load modification model parameters from `<path>/model.toml`.
    pub fn load(model_path: &Path) -> Result<Self> {
        let toml_path = model_path.join("model.toml");
        let text = std::fs::read_to_string(&toml_path).map_err(|e| SquallError::InvalidFileFormat {
            file_type: "modbase model".to_string(),
            path: toml_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let parsed: ModBaseToml =
            toml::from_str(&text).map_err(|e| SquallError::InvalidFileFormat {
                file_type: "modbase model".to_string(),
                path: toml_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let canonical = *parsed.modbase.canonical.as_bytes().first().ok_or_else(|| {
            SquallError::InvalidParameter {
                parameter: "canonical".to_string(),
                reason: "modbase model declares no canonical base".to_string(),
            }
        })?;
        if parsed.modbase.alphabet.is_empty() || parsed.modbase.context_samples == 0 {
            return Err(SquallError::InvalidParameter {
                parameter: "modbase model".to_string(),
                reason: "alphabet and context_samples must be non-empty".to_string(),
            });
        }
        let model_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self {
            model_name,
            alphabet: parsed.modbase.alphabet,
            canonical,
            context_samples: parsed.modbase.context_samples,
        })
    }

    /// Number of probability channels this model contributes per base.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.alphabet.len()
    }
}

/// One modification-model scorer bound to one device.
pub struct RemoraCaller {
    params: RemoraParams,
    device_ordinal: Option<usize>,
    batch_size: usize,
}

impl RemoraCaller {
    #[must_use]
    pub fn new(params: RemoraParams, device_ordinal: Option<usize>, batch_size: usize) -> Self {
        Self { params, device_ordinal, batch_size: batch_size.max(1) }
    }

    #[must_use]
    pub fn params(&self) -> &RemoraParams {
        &self.params
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Score `count` staged windows; returns `count * channel_count` bytes.
    ///
    /// Scoring is a pure function of the window contents, which keeps
    /// pipeline output reproducible across runs.
    fn call_batch(&self, slab: &[f32], count: usize) -> Vec<u8> {
        let _device = self.device_ordinal.map(crate::runner::device_lock);
        let window = self.params.context_samples;
        let channels = self.params.channel_count();
        let mut probs = Vec::with_capacity(count * channels);
        for site in 0..count {
            let row = &slab[site * window..(site + 1) * window];
            let mut acc = 0u64;
            for &v in row {
                acc = acc.wrapping_mul(31).wrapping_add(v.abs().mul_add(16.0, 0.5) as u64);
            }
            for channel in 0..channels {
                probs.push(((acc >> (8 * (channel % 8))) & 0xff) as u8);
            }
        }
        probs
    }
}

/// A per-site window travelling from the chunkers to a caller lane.
struct ModBaseChunk {
    ordinal: usize,
    /// Base index within the read's sequence.
    seq_pos: usize,
    window: Vec<f32>,
}

struct SiteResult {
    ordinal: usize,
    seq_pos: usize,
    channel_offset: usize,
    probs: Vec<u8>,
}

struct PendingRead {
    msg: Message,
    outstanding: usize,
}

#[derive(Default)]
struct ReadArena {
    slots: Vec<Option<PendingRead>>,
    free: Vec<usize>,
}

impl ReadArena {
    fn insert(&mut self, pending: PendingRead) -> usize {
        if let Some(ordinal) = self.free.pop() {
            self.slots[ordinal] = Some(pending);
            ordinal
        } else {
            self.slots.push(Some(pending));
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, ordinal: usize) -> PendingRead {
        let pending = self.slots[ordinal].take().expect("read ordinal already freed");
        self.free.push(ordinal);
        pending
    }
}

#[derive(Default)]
struct Counters {
    num_reads_in: AtomicU64,
    num_sites: AtomicU64,
    num_batches_called: AtomicU64,
    num_timeouts: AtomicU64,
    num_reads_out: AtomicU64,
}

/// A caller lane: one caller, routed from one per-model queue.
struct Lane {
    caller: RemoraCaller,
    model_idx: usize,
    channel_offset: usize,
}

struct Inner {
    input: WorkQueue<Message>,
    model_queues: Vec<WorkQueue<ModBaseChunk>>,
    result_queue: WorkQueue<SiteResult>,
    arena: Mutex<ReadArena>,
    sink: NodeHandle,
    lanes: Vec<Lane>,
    pool: MemoryManager<f32>,
    /// (canonical, channel_offset, context) per model, in lane model order.
    models: Vec<(u8, usize, usize)>,
    mod_base_info: ModBaseInfo,
    batch_timeout: Duration,
    counters: Counters,
}

impl Inner {
    fn chunk_read(&self, mut msg: Message) {
        let total_channels = self.mod_base_info.channel_count;
        let common = msg.read_common_mut().expect("read message");
        let seq_len = common.seq.len();

        // Signal sample at the centre of each called base: position of the
        // i-th set move bit times the stride, offset by the trimmed head.
        let stride = common.model_stride.max(1);
        let trim = common.num_trimmed_samples;
        let mut base_centres = Vec::with_capacity(seq_len);
        for (step, &mv) in common.moves.iter().enumerate() {
            if mv == 1 {
                base_centres.push(trim + step * stride);
            }
        }
        if base_centres.len() < seq_len {
            log::warn!("read {} has fewer moves than bases; skipping modbase", common.read_id);
            send_to_sink(&self.sink, msg);
            return;
        }
        let common = msg.read_common_mut().expect("read message");
        common.base_mod_probs = Some(vec![0u8; seq_len * total_channels]);
        common.mod_base_info = Some(self.mod_base_info.clone());

        let mut sites: Vec<(usize, usize)> = Vec::new();
        for (model_idx, &(canonical, _, _)) in self.models.iter().enumerate() {
            for (seq_pos, &base) in common.seq.iter().enumerate() {
                if base == canonical {
                    sites.push((model_idx, seq_pos));
                }
            }
        }

        if sites.is_empty() {
            self.counters.num_reads_out.fetch_add(1, Ordering::Relaxed);
            send_to_sink(&self.sink, msg);
            return;
        }

        let raw: Vec<f32> = common.raw_signal.iter().map(|&v| f32::from(v)).collect();
        let outstanding = sites.len();
        self.counters.num_sites.fetch_add(outstanding as u64, Ordering::Relaxed);
        let ordinal = self.arena.lock().insert(PendingRead { msg, outstanding });

        for (model_idx, seq_pos) in sites {
            let context = self.models[model_idx].2;
            let centre = base_centres[seq_pos];
            let mut window = vec![0.0f32; context];
            let half = context / 2;
            let lo = centre.saturating_sub(half);
            for (w, r) in window.iter_mut().zip(lo..lo + context) {
                if let Some(&v) = raw.get(r) {
                    *w = v;
                }
            }
            let chunk = ModBaseChunk { ordinal, seq_pos, window };
            if self.model_queues[model_idx].push(chunk).is_err() {
                return;
            }
        }
    }

    fn input_loop(&self) {
        while let Some(msg) = self.input.pop() {
            let is_callable = msg
                .read_common()
                .is_some_and(|c| !c.seq.is_empty() && !c.moves.is_empty());
            if is_callable {
                self.counters.num_reads_in.fetch_add(1, Ordering::Relaxed);
                self.chunk_read(msg);
            } else {
                send_to_sink(&self.sink, msg);
            }
        }
    }

    fn fire_batch(&self, lane: &Lane, slab: &[f32], staged: &mut Vec<ModBaseChunk>) {
        self.counters.num_batches_called.fetch_add(1, Ordering::Relaxed);
        let probs = lane.caller.call_batch(slab, staged.len());
        let channels = lane.caller.params().channel_count();
        for (site, chunk) in staged.drain(..).enumerate() {
            let result = SiteResult {
                ordinal: chunk.ordinal,
                seq_pos: chunk.seq_pos,
                channel_offset: lane.channel_offset,
                probs: probs[site * channels..(site + 1) * channels].to_vec(),
            };
            if self.result_queue.push(result).is_err() {
                return;
            }
        }
    }

    fn caller_loop(&self, lane_idx: usize) {
        let lane = &self.lanes[lane_idx];
        let queue = &self.model_queues[lane.model_idx];
        let batch_size = lane.caller.batch_size();
        let window = lane.caller.params().context_samples;
        let mut staged: Vec<ModBaseChunk> = Vec::with_capacity(batch_size);
        let mut batch_start: Option<Instant> = None;
        // Acquired when a batch opens, released when it fires.
        let mut slab: Option<crate::memory::SlabGuard<'_, f32>> = None;

        loop {
            let popped = match batch_start {
                Some(t0) => queue.pop_with_deadline(t0 + self.batch_timeout),
                None => match queue.pop() {
                    Some(chunk) => PopResult::Item(chunk),
                    None => PopResult::Terminated,
                },
            };
            match popped {
                PopResult::Item(chunk) => {
                    if staged.is_empty() {
                        batch_start = Some(Instant::now());
                        slab = Some(self.pool.acquire());
                    }
                    let slot = staged.len();
                    let buf = slab.as_mut().expect("slab held while batch open");
                    buf[slot * window..slot * window + chunk.window.len()]
                        .copy_from_slice(&chunk.window);
                    staged.push(chunk);
                    if staged.len() == batch_size {
                        let guard = slab.take().expect("slab held while batch open");
                        self.fire_batch(lane, &guard, &mut staged);
                        batch_start = None;
                    }
                }
                PopResult::TimedOut => {
                    self.counters.num_timeouts.fetch_add(1, Ordering::Relaxed);
                    let guard = slab.take().expect("slab held while batch open");
                    self.fire_batch(lane, &guard, &mut staged);
                    batch_start = None;
                }
                PopResult::Terminated => {
                    if !staged.is_empty() {
                        let guard = slab.take().expect("slab held while batch open");
                        self.fire_batch(lane, &guard, &mut staged);
                    }
                    return;
                }
            }
        }
    }

    fn output_loop(&self) {
        while let Some(result) = self.result_queue.pop() {
            let finished = {
                let mut arena = self.arena.lock();
                let pending = arena.slots[result.ordinal].as_mut().expect("result for freed read");
                let common = pending.msg.read_common_mut().expect("read message");
                let total = self.mod_base_info.channel_count;
                if let Some(probs) = common.base_mod_probs.as_mut() {
                    let base = result.seq_pos * total + result.channel_offset;
                    probs[base..base + result.probs.len()].copy_from_slice(&result.probs);
                }
                pending.outstanding -= 1;
                if pending.outstanding == 0 {
                    Some(arena.remove(result.ordinal))
                } else {
                    None
                }
            };
            if let Some(pending) = finished {
                self.counters.num_reads_out.fetch_add(1, Ordering::Relaxed);
                send_to_sink(&self.sink, pending.msg);
            }
        }
    }
}

#[derive(Default)]
struct WorkerHandles {
    inputs: Vec<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
}

/// The modified-base calling node.
pub struct ModBaseCallerNode {
    inner: Arc<Inner>,
    num_input_threads: usize,
    workers: Mutex<WorkerHandles>,
}

impl ModBaseCallerNode {
    /// Build the node and start its workers.
    ///
    /// `callers` may hold several callers per model (one per device); chunks
    /// are routed per model, and channel offsets follow the order in which
    /// models first appear.
    pub fn new(
        sink: NodeHandle,
        callers: Vec<RemoraCaller>,
        num_input_threads: usize,
        batch_timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self> {
        if callers.is_empty() {
            return Err(SquallError::InvalidParameter {
                parameter: "callers".to_string(),
                reason: "at least one modification caller is required".to_string(),
            });
        }

        // Assign channel offsets per distinct model, preserving order.
        let mut models: Vec<(u8, usize, usize)> = Vec::new();
        let mut model_names: Vec<String> = Vec::new();
        let mut alphabet = String::new();
        let mut canonical_bases = String::new();
        let mut offset = 0usize;
        for caller in &callers {
            let p = caller.params();
            if !model_names.contains(&p.model_name) {
                model_names.push(p.model_name.clone());
                models.push((p.canonical, offset, p.context_samples));
                alphabet.push_str(&p.alphabet);
                for _ in 0..p.channel_count() {
                    canonical_bases.push(char::from(p.canonical));
                }
                offset += p.channel_count();
            }
        }
        let mod_base_info =
            ModBaseInfo { alphabet, canonical_bases, channel_count: offset };

        let max_slab: usize = callers
            .iter()
            .map(|c| c.batch_size() * c.params().context_samples)
            .max()
            .unwrap_or(0);
        let pool = MemoryManager::new(callers.len(), max_slab);

        let lanes: Vec<Lane> = callers
            .into_iter()
            .map(|caller| {
                let model_idx = model_names
                    .iter()
                    .position(|n| n == &caller.params().model_name)
                    .expect("model registered above");
                let channel_offset = models[model_idx].1;
                pool.register_user().map(|()| Lane { caller, model_idx, channel_offset })
            })
            .collect::<Result<_>>()?;

        let inner = Arc::new(Inner {
            input: WorkQueue::new(queue_capacity),
            model_queues: model_names.iter().map(|_| WorkQueue::new(queue_capacity)).collect(),
            result_queue: WorkQueue::new(queue_capacity),
            arena: Mutex::new(ReadArena::default()),
            sink,
            lanes,
            pool,
            models,
            mod_base_info,
            batch_timeout,
            counters: Counters::default(),
        });
        let node = Self {
            inner,
            num_input_threads: num_input_threads.max(1),
            workers: Mutex::new(WorkerHandles::default()),
        };
        node.start_workers();
        Ok(node)
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock();
        for i in 0..self.num_input_threads {
            let inner = Arc::clone(&self.inner);
            workers.inputs.push(
                std::thread::Builder::new()
                    .name(format!("modbase_in_{i}"))
                    .spawn(move || inner.input_loop())
                    .expect("failed to spawn modbase input thread"),
            );
        }
        for lane_idx in 0..self.inner.lanes.len() {
            let inner = Arc::clone(&self.inner);
            workers.lanes.push(
                std::thread::Builder::new()
                    .name(format!("modbase_caller_{lane_idx}"))
                    .spawn(move || inner.caller_loop(lane_idx))
                    .expect("failed to spawn modbase caller thread"),
            );
        }
        let inner = Arc::clone(&self.inner);
        workers.output = Some(
            std::thread::Builder::new()
                .name("modbase_out".into())
                .spawn(move || inner.output_loop())
                .expect("failed to spawn modbase output thread"),
        );
    }
}

impl PipelineNode for ModBaseCallerNode {
    fn name(&self) -> &'static str {
        "mod_base_caller"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let c = &self.inner.counters;
        let mut stats = NamedStats::new();
        stats.insert("num_reads_in".to_string(), c.num_reads_in.load(Ordering::Relaxed) as f64);
        stats.insert("num_sites".to_string(), c.num_sites.load(Ordering::Relaxed) as f64);
        stats.insert("num_batches_called".to_string(), c.num_batches_called.load(Ordering::Relaxed) as f64);
        stats.insert("num_timeouts".to_string(), c.num_timeouts.load(Ordering::Relaxed) as f64);
        stats.insert("num_reads_out".to_string(), c.num_reads_out.load(Ordering::Relaxed) as f64);
        stats.insert("work_queue_depth".to_string(), self.inner.input.len() as f64);
        stats
    }

    fn terminate(&self, _flush: &FlushOptions) {
        let mut workers = self.workers.lock();

        self.inner.input.terminate();
        for input in workers.inputs.drain(..) {
            let _ = input.join();
        }

        for queue in &self.inner.model_queues {
            queue.terminate();
        }
        for lane in workers.lanes.drain(..) {
            let _ = lane.join();
        }

        self.inner.result_queue.terminate();
        if let Some(output) = workers.output.take() {
            let _ = output.join();
        }
    }

    fn restart(&self) {
        self.inner.input.restart();
        for queue in &self.inner.model_queues {
            queue.restart();
        }
        self.inner.result_queue.restart();
        self.start_workers();
    }
}
