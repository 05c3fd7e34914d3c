//! The batching basecaller stage.
//!
//! Three lanes share two internal queues:
//!
//! ```text
//!  input ──> chunker ──> chunk queue ──> runner lanes ──> result queue ──> reassembly ──> sink
//!            (1 thread)                  (1 per runner)                    (1 thread)
//! ```
//!
//! The chunker splits each read's scaled signal into fixed-size overlapping
//! chunks and parks the read in an arena keyed by a dense ordinal; chunks
//! carry the ordinal, not a shared reference. Runner lanes stage chunks into
//! their runner's batch tensor and fire inference when the batch fills or
//! the batch timeout expires. The reassembly lane collects decoded fragments
//! and, once a read's outstanding-chunk count reaches zero, stitches them
//! into the final sequence and forwards the read.
//!
//! Back-pressure: both internal queues are bounded, so a full result queue
//! blocks the runner lanes after `call_chunks`, which blocks the chunker,
//! which blocks the upstream scaler.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::decode::DecodedChunk;
use crate::errors::{Result, SquallError};
use crate::messages::Message;
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::runner::Runner;
use crate::stats::NamedStats;
use crate::work_queue::{PopResult, WorkQueue};

/// Failure tag attached to reads abandoned by a failed batch.
pub const BASECALL_FAILED: &str = "basecall_failed";

/// Geometry of one chunk within a read's signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// First signal sample covered by the chunk.
    pub start: usize,
    /// Zero samples prepended when the signal is shorter than a chunk.
    pub left_pad: usize,
    /// Real samples covered; `left_pad + span == chunk_size`.
    pub span: usize,
}

/// Compute the chunk list for a signal of `signal_len` samples.
///
/// A signal no longer than one chunk yields a single chunk. Otherwise the
/// count is `max(2, (signal_len - overlap) / (chunk_size - overlap))`:
/// interior chunk `i` starts at `i * (chunk_size - overlap)` and the last
/// chunk is right-aligned against the signal end (left-padded with zeros
/// when the whole signal is shorter than one chunk). Right-aligning must
/// not open a gap behind the second-to-last chunk; one extra chunk is added
/// when it would.
#[must_use]
pub fn chunk_layout(signal_len: usize, chunk_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    let step = chunk_size - overlap;
    let mut num_chunks = if signal_len <= chunk_size {
        1
    } else {
        std::cmp::max(2, signal_len.saturating_sub(overlap) / step)
    };
    if num_chunks >= 2 && (num_chunks - 2) * step + chunk_size < signal_len - chunk_size {
        num_chunks += 1;
    }
    let mut layout = Vec::with_capacity(num_chunks);
    for i in 0..num_chunks {
        if i + 1 == num_chunks {
            if signal_len >= chunk_size {
                layout.push(ChunkSpan { start: signal_len - chunk_size, left_pad: 0, span: chunk_size });
            } else {
                layout.push(ChunkSpan { start: 0, left_pad: chunk_size - signal_len, span: signal_len });
            }
        } else {
            layout.push(ChunkSpan { start: i * step, left_pad: 0, span: chunk_size });
        }
    }
    layout
}

/// Half-open keep-windows implementing the midpoint stitch rule.
///
/// Adjacent chunks split their overlap at its midpoint, snapped down to a
/// stride boundary; the first window starts at 0 and the last ends at the
/// signal end, so the windows partition `[0, signal_len)`.
#[must_use]
pub fn keep_windows(layout: &[ChunkSpan], signal_len: usize, stride: usize) -> Vec<(usize, usize)> {
    let mut windows = Vec::with_capacity(layout.len());
    let mut lo = 0usize;
    for i in 0..layout.len() {
        let hi = if i + 1 == layout.len() {
            signal_len
        } else {
            let end = layout[i].start + layout[i].span;
            let mid = (layout[i + 1].start + end) / 2;
            ((mid / stride) * stride).max(lo)
        };
        windows.push((lo, hi));
        lo = hi;
    }
    windows
}

/// A chunk travelling from the chunker to a runner lane.
#[derive(Debug, Clone, Copy)]
struct BasecallChunk {
    ordinal: usize,
    index: usize,
    span: ChunkSpan,
}

enum ChunkOutcome {
    Decoded(DecodedChunk),
    Failed,
}

struct ChunkResult {
    ordinal: usize,
    index: usize,
    outcome: ChunkOutcome,
}

struct PendingRead {
    msg: Message,
    outstanding: usize,
    partials: Vec<Option<DecodedChunk>>,
    failed: bool,
}

/// Arena of in-flight reads, indexed by dense ordinals.
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

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Default)]
struct WorkerHandles {
    chunker: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
    reassembly: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    num_reads_in: AtomicU64,
    num_chunks_in: AtomicU64,
    num_batches_called: AtomicU64,
    num_timeouts: AtomicU64,
    num_reads_out: AtomicU64,
    num_failed_reads: AtomicU64,
    batch_fill_sum: AtomicU64,
}

struct Inner {
    input: WorkQueue<Message>,
    chunk_queue: WorkQueue<BasecallChunk>,
    result_queue: WorkQueue<ChunkResult>,
    arena: Mutex<ReadArena>,
    sink: NodeHandle,
    runners: Vec<Mutex<Runner>>,
    model_name: String,
    stride: usize,
    chunk_size: usize,
    overlap: usize,
    batch_timeout: Duration,
    counters: Counters,
}

impl Inner {
    fn chunker_loop(&self) {
        while let Some(msg) = self.input.pop() {
            let is_read = msg.read_common().is_some_and(|c| !c.scaled_signal.is_empty());
            if !is_read {
                send_to_sink(&self.sink, msg);
                continue;
            }
            self.counters.num_reads_in.fetch_add(1, Ordering::Relaxed);

            let signal_len = msg.read_common().expect("read message").scaled_signal.len();
            let layout = chunk_layout(signal_len, self.chunk_size, self.overlap);
            let num_chunks = layout.len();

            let ordinal = self.arena.lock().insert(PendingRead {
                msg,
                outstanding: num_chunks,
                partials: vec![None; num_chunks],
                failed: false,
            });

            for (index, span) in layout.into_iter().enumerate() {
                self.counters.num_chunks_in.fetch_add(1, Ordering::Relaxed);
                if self.chunk_queue.push(BasecallChunk { ordinal, index, span }).is_err() {
                    return;
                }
            }
        }
    }

    /// Copy a chunk's signal view into the runner's batch tensor.
    fn stage_chunk(&self, runner: &mut Runner, slot: usize, chunk: &BasecallChunk, scratch: &mut [f32]) {
        scratch.fill(0.0);
        let arena = self.arena.lock();
        let pending = arena.slots[chunk.ordinal].as_ref().expect("chunk for freed read");
        let signal = &pending.msg.read_common().expect("read message").scaled_signal;
        let span = chunk.span;
        scratch[span.left_pad..span.left_pad + span.span]
            .copy_from_slice(&signal[span.start..span.start + span.span]);
        drop(arena);
        runner.accept_chunk(slot, scratch);
    }

    fn fire_batch(&self, runner: &mut Runner, staged: &mut Vec<BasecallChunk>) {
        self.counters.num_batches_called.fetch_add(1, Ordering::Relaxed);
        self.counters.batch_fill_sum.fetch_add(staged.len() as u64, Ordering::Relaxed);

        match runner.call_chunks(staged.len()) {
            Ok(scores) => {
                for (slot, chunk) in staged.drain(..).enumerate() {
                    let decoded = runner.decode(&scores, slot);
                    let result = ChunkResult {
                        ordinal: chunk.ordinal,
                        index: chunk.index,
                        outcome: ChunkOutcome::Decoded(decoded),
                    };
                    if self.result_queue.push(result).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("batch of {} chunks failed on {}: {e}", staged.len(), self.model_name);
                for chunk in staged.drain(..) {
                    let result = ChunkResult {
                        ordinal: chunk.ordinal,
                        index: chunk.index,
                        outcome: ChunkOutcome::Failed,
                    };
                    if self.result_queue.push(result).is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn runner_loop(&self, lane: usize) {
        let mut runner = self.runners[lane].lock();
        let batch_size = runner.batch_size();
        let mut scratch = vec![0.0f32; self.chunk_size];
        let mut staged: Vec<BasecallChunk> = Vec::with_capacity(batch_size);
        let mut batch_start: Option<Instant> = None;

        loop {
            let popped = match batch_start {
                Some(t0) => self.chunk_queue.pop_with_deadline(t0 + self.batch_timeout),
                None => match self.chunk_queue.pop() {
                    Some(chunk) => PopResult::Item(chunk),
                    None => PopResult::Terminated,
                },
            };
            match popped {
                PopResult::Item(chunk) => {
                    if staged.is_empty() {
                        batch_start = Some(Instant::now());
                    }
                    let slot = staged.len();
                    self.stage_chunk(&mut runner, slot, &chunk, &mut scratch);
                    staged.push(chunk);
                    if staged.len() == batch_size {
                        self.fire_batch(&mut runner, &mut staged);
                        batch_start = None;
                    }
                }
                PopResult::TimedOut => {
                    self.counters.num_timeouts.fetch_add(1, Ordering::Relaxed);
                    self.fire_batch(&mut runner, &mut staged);
                    batch_start = None;
                }
                PopResult::Terminated => {
                    if !staged.is_empty() {
                        self.fire_batch(&mut runner, &mut staged);
                    }
                    return;
                }
            }
        }
    }

    fn reassembly_loop(&self) {
        while let Some(result) = self.result_queue.pop() {
            let finished = {
                let mut arena = self.arena.lock();
                let pending =
                    arena.slots[result.ordinal].as_mut().expect("result for freed read");
                match result.outcome {
                    ChunkOutcome::Decoded(decoded) => pending.partials[result.index] = Some(decoded),
                    ChunkOutcome::Failed => pending.failed = true,
                }
                pending.outstanding -= 1;
                if pending.outstanding == 0 {
                    Some(arena.remove(result.ordinal))
                } else {
                    None
                }
            };
            if let Some(pending) = finished {
                self.finish_read(pending);
            }
        }
    }

    fn finish_read(&self, pending: PendingRead) {
        let mut msg = pending.msg;
        {
            let common = msg.read_common_mut().expect("read message");
            common.model_stride = self.stride;
            if pending.failed {
                common.seq = Vec::new();
                common.qstring = Vec::new();
                common.moves = Vec::new();
                common.failure = Some(BASECALL_FAILED);
                self.counters.num_failed_reads.fetch_add(1, Ordering::Relaxed);
            } else {
                let partials: Vec<DecodedChunk> =
                    pending.partials.into_iter().map(|p| p.expect("missing chunk partial")).collect();
                stitch_read(common, &partials, self.chunk_size, self.overlap, self.stride);
            }
            common.scaled_signal = Vec::new();
        }
        self.counters.num_reads_out.fetch_add(1, Ordering::Relaxed);
        send_to_sink(&self.sink, msg);
    }
}

/// Stitch decoded chunk fragments into the read, in place.
///
/// Each chunk contributes only the bases whose originating signal position
/// falls inside its keep-window; the final move table covers the whole
/// signal, one entry per stride step.
fn stitch_read(
    common: &mut crate::messages::ReadCommon,
    partials: &[DecodedChunk],
    chunk_size: usize,
    overlap: usize,
    stride: usize,
) {
    let signal_len = common.scaled_signal.len();
    let layout = chunk_layout(signal_len, chunk_size, overlap);
    let windows = keep_windows(&layout, signal_len, stride);

    let mut seq = Vec::new();
    let mut qstring = Vec::new();
    let mut moves = vec![0u8; signal_len / stride];

    for (i, decoded) in partials.iter().enumerate() {
        let span = layout[i];
        let (keep_lo, keep_hi) = windows[i];
        let virtual_start = span.start as i64 - span.left_pad as i64;
        let mut emit = 0usize;
        for (step, &mv) in decoded.moves.iter().enumerate() {
            if mv == 0 {
                continue;
            }
            let pos = virtual_start + (step * stride) as i64;
            if pos >= keep_lo as i64 && pos < keep_hi as i64 {
                seq.push(decoded.seq[emit]);
                qstring.push(decoded.qstring[emit]);
                moves[pos as usize / stride] = 1;
            }
            emit += 1;
        }
    }

    common.seq = seq;
    common.qstring = qstring;
    common.moves = moves;
}

/// The batching basecaller node.
pub struct BasecallerNode {
    inner: Arc<Inner>,
    workers: Mutex<WorkerHandles>,
}

impl BasecallerNode {
    /// Build the node and start its workers.
    ///
    /// The first runner's stride and adjusted chunk size are authoritative;
    /// all runners must agree. `overlap` is adjusted down to a stride
    /// multiple.
    pub fn new(
        sink: NodeHandle,
        runners: Vec<Runner>,
        overlap: usize,
        batch_timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self> {
        let first = runners.first().ok_or_else(|| SquallError::InvalidParameter {
            parameter: "runners".to_string(),
            reason: "at least one runner is required".to_string(),
        })?;
        let stride = first.model_stride();
        let chunk_size = first.chunk_size();
        let model_name = first.model_name().to_string();
        if runners.iter().any(|r| r.model_stride() != stride || r.chunk_size() != chunk_size) {
            return Err(SquallError::InvalidParameter {
                parameter: "runners".to_string(),
                reason: "all runners must share one model stride and chunk size".to_string(),
            });
        }
        let overlap = (overlap / stride) * stride;
        if overlap >= chunk_size {
            return Err(SquallError::InvalidParameter {
                parameter: "overlap".to_string(),
                reason: format!("{overlap} must be smaller than the chunk size {chunk_size}"),
            });
        }

        let max_batch = runners.iter().map(Runner::batch_size).max().unwrap_or(1);
        let inner = Arc::new(Inner {
            input: WorkQueue::new(queue_capacity),
            chunk_queue: WorkQueue::new(std::cmp::max(4 * max_batch, 64)),
            result_queue: WorkQueue::new(std::cmp::max(4 * max_batch, 64)),
            arena: Mutex::new(ReadArena::default()),
            sink,
            runners: runners.into_iter().map(Mutex::new).collect(),
            model_name,
            stride,
            chunk_size,
            overlap,
            batch_timeout,
            counters: Counters::default(),
        });
        let node = Self { inner, workers: Mutex::new(WorkerHandles::default()) };
        node.start_workers();
        Ok(node)
    }

    /// Stride-adjusted chunk size in effect for this node.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Stride-adjusted overlap in effect for this node.
    #[must_use]
    pub fn overlap(&self) -> usize {
        self.inner.overlap
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock();

        let inner = Arc::clone(&self.inner);
        workers.chunker = Some(
            std::thread::Builder::new()
                .name("bc_chunker".into())
                .spawn(move || inner.chunker_loop())
                .expect("failed to spawn chunker thread"),
        );

        for lane in 0..self.inner.runners.len() {
            let inner = Arc::clone(&self.inner);
            workers.lanes.push(
                std::thread::Builder::new()
                    .name(format!("bc_runner_{lane}"))
                    .spawn(move || inner.runner_loop(lane))
                    .expect("failed to spawn runner lane thread"),
            );
        }

        let inner = Arc::clone(&self.inner);
        workers.reassembly = Some(
            std::thread::Builder::new()
                .name("bc_stitch".into())
                .spawn(move || inner.reassembly_loop())
                .expect("failed to spawn reassembly thread"),
        );
    }
}

impl PipelineNode for BasecallerNode {
    fn name(&self) -> &'static str {
        "basecaller"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let c = &self.inner.counters;
        let mut stats = NamedStats::new();
        let batches = c.num_batches_called.load(Ordering::Relaxed);
        let fill_sum = c.batch_fill_sum.load(Ordering::Relaxed);
        stats.insert("num_reads_in".to_string(), c.num_reads_in.load(Ordering::Relaxed) as f64);
        stats.insert("num_chunks_in".to_string(), c.num_chunks_in.load(Ordering::Relaxed) as f64);
        stats.insert("num_batches_called".to_string(), batches as f64);
        stats.insert(
            "mean_batch_fill".to_string(),
            if batches > 0 { fill_sum as f64 / batches as f64 } else { 0.0 },
        );
        stats.insert("num_timeouts".to_string(), c.num_timeouts.load(Ordering::Relaxed) as f64);
        stats.insert("num_reads_out".to_string(), c.num_reads_out.load(Ordering::Relaxed) as f64);
        stats.insert("num_failed_reads".to_string(), c.num_failed_reads.load(Ordering::Relaxed) as f64);
        stats.insert("work_queue_depth".to_string(), self.inner.input.len() as f64);
        stats.insert("chunk_queue_depth".to_string(), self.inner.chunk_queue.len() as f64);
        stats.insert("result_queue_depth".to_string(), self.inner.result_queue.len() as f64);
        stats.insert("reads_in_flight".to_string(), self.inner.arena.lock().len() as f64);
        stats
    }

    fn terminate(&self, _flush: &FlushOptions) {
        let mut workers = self.workers.lock();

        self.inner.input.terminate();
        if let Some(chunker) = workers.chunker.take() {
            let _ = chunker.join();
        }

        self.inner.chunk_queue.terminate();
        for lane in workers.lanes.drain(..) {
            let _ = lane.join();
        }

        self.inner.result_queue.terminate();
        if let Some(reassembly) = workers.reassembly.take() {
            let _ = reassembly.join();
        }
    }

    fn restart(&self) {
        self.inner.input.restart();
        self.inner.chunk_queue.restart();
        self.inner.result_queue.restart();
        self.start_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SimplexRead;
    use crate::node::testing::CaptureSink;
    use crate::runner::{CpuRunner, RunnerParams};

    fn make_runner(stride: usize, chunk_size: usize, batch_size: usize) -> Runner {
        let params =
            RunnerParams::new("test_model".to_string(), stride, chunk_size, batch_size).unwrap();
        Runner::Cpu(CpuRunner::new(params))
    }

    fn scaled_read(id: &str, len: usize) -> Message {
        let mut read = SimplexRead::default();
        read.common.read_id = id.to_string();
        read.common.raw_signal = vec![0i16; len];
        read.common.scaled_signal = (0..len).map(|i| ((i / 40) % 9) as f32 / 4.0 - 1.0).collect();
        read.common.model_stride = 5;
        Message::SimplexRead(Box::new(read))
    }

    #[test]
    fn test_chunk_layout_interior_and_right_aligned() {
        // 4000 samples at chunk 2000 / overlap 400: exactly two chunks, the
        // second right-aligned against the signal end.
        let layout = chunk_layout(4000, 2000, 400);
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[0], ChunkSpan { start: 0, left_pad: 0, span: 2000 });
        assert_eq!(layout[1], ChunkSpan { start: 2000, left_pad: 0, span: 2000 });

        let layout = chunk_layout(5200, 2000, 400);
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[1], ChunkSpan { start: 1600, left_pad: 0, span: 2000 });
        assert_eq!(layout[2], ChunkSpan { start: 3200, left_pad: 0, span: 2000 });
    }

    #[test]
    fn test_chunk_layout_short_read_is_padded() {
        let layout = chunk_layout(1200, 2000, 400);
        assert_eq!(layout, vec![ChunkSpan { start: 0, left_pad: 800, span: 1200 }]);
    }

    #[test]
    fn test_chunk_layout_exact_fit() {
        let layout = chunk_layout(2000, 2000, 400);
        assert_eq!(layout, vec![ChunkSpan { start: 0, left_pad: 0, span: 2000 }]);
    }

    #[test]
    fn test_chunk_layout_counts() {
        for (len, expected) in [(2000, 1), (2001, 2), (3600, 2), (4000, 2), (5200, 3), (9999, 6)] {
            assert_eq!(chunk_layout(len, 2000, 400).len(), expected, "len={len}");
        }
    }

    #[test]
    fn test_chunk_layout_covers_signal() {
        // The chunk union covers [0, len) for lengths around every chunk
        // boundary, including ones where right-alignment needs a repair
        // chunk.
        for len in [1, 1999, 2000, 2001, 3599, 3600, 3601, 5199, 5200, 5201, 9998, 9999, 10000] {
            let layout = chunk_layout(len, 2000, 400);
            let mut covered = 0usize;
            for span in &layout {
                assert!(span.start <= covered, "gap before {} at len={len}", span.start);
                covered = covered.max(span.start + span.span);
            }
            assert_eq!(covered, len, "coverage ends early at len={len}");
        }
    }

    #[test]
    fn test_keep_windows_partition_signal() {
        let layout = chunk_layout(5200, 2000, 400);
        let windows = keep_windows(&layout, 5200, 5);
        assert_eq!(windows.first().unwrap().0, 0);
        assert_eq!(windows.last().unwrap().1, 5200);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        for (lo, hi) in &windows {
            assert_eq!(lo % 5, 0);
            assert!(hi >= lo);
        }
    }

    fn run_reads_through(
        runners: Vec<Runner>,
        overlap: usize,
        reads: Vec<Message>,
        timeout: Duration,
    ) -> (Arc<CaptureSink>, NamedStats) {
        let sink = CaptureSink::new(1024);
        let node = BasecallerNode::new(sink.clone(), runners, overlap, timeout, 1024).unwrap();
        for read in reads {
            node.push_message(read).unwrap();
        }
        node.terminate(&FlushOptions::default());
        let stats = node.sample_stats();
        (sink, stats)
    }

    #[test]
    fn test_single_read_invariants() {
        let (sink, stats) = run_reads_through(
            vec![make_runner(5, 2000, 16)],
            400,
            vec![scaled_read("r1", 4000)],
            Duration::from_millis(50),
        );
        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        let common = messages[0].read_common().unwrap();
        let popcount: usize = common.moves.iter().map(|&m| usize::from(m)).sum();
        assert_eq!(popcount, common.seq.len());
        assert_eq!(common.seq.len(), common.qstring.len());
        assert_eq!(common.moves.len(), 4000 / 5);
        assert!(common.scaled_signal.is_empty());
        assert!(!common.seq.is_empty());
        assert_eq!(stats.get("num_reads_out"), Some(&1.0));
    }

    #[test]
    fn test_batch_timeout_fires_partial_batch() {
        let sink = CaptureSink::new(64);
        let node = BasecallerNode::new(
            sink.clone(),
            vec![make_runner(5, 2000, 16)],
            400,
            Duration::from_millis(100),
            64,
        )
        .unwrap();
        let start = Instant::now();
        node.push_message(scaled_read("r1", 1500)).unwrap();

        // Wait for the read to come out the far end without terminating, so
        // the flush-on-terminate path cannot be what fired the batch.
        while sink.messages.lock().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for read");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
        let stats = node.sample_stats();
        assert_eq!(stats.get("num_timeouts"), Some(&1.0));
        assert_eq!(stats.get("mean_batch_fill"), Some(&1.0));
        node.terminate(&FlushOptions::default());
    }

    #[test]
    fn test_stitch_covers_every_position_once() {
        let (sink, stats) = run_reads_through(
            vec![make_runner(5, 500, 4)],
            100,
            vec![scaled_read("r1", 2600)],
            Duration::from_millis(20),
        );
        let messages = sink.messages.lock();
        let common = messages[0].read_common().unwrap();
        let popcount: usize = common.moves.iter().map(|&m| usize::from(m)).sum();
        assert_eq!(popcount, common.seq.len());
        assert_eq!(common.moves.len(), 2600 / 5);
        assert!(stats.get("num_chunks_in").copied().unwrap_or(0.0) > 1.0);
    }

    #[test]
    fn test_failed_batch_marks_reads() {
        let mut read = SimplexRead::default();
        read.common.read_id = "bad".to_string();
        read.common.scaled_signal = vec![f32::NAN; 1000];
        let (sink, stats) = run_reads_through(
            vec![make_runner(5, 2000, 4)],
            400,
            vec![Message::SimplexRead(Box::new(read))],
            Duration::from_millis(20),
        );
        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        let common = messages[0].read_common().unwrap();
        assert!(common.seq.is_empty());
        assert_eq!(common.failure, Some(BASECALL_FAILED));
        assert_eq!(stats.get("num_failed_reads"), Some(&1.0));
    }

    #[test]
    fn test_non_read_messages_pass_through() {
        let aln = Message::CorrectionAlignments(crate::messages::CorrectionAlignments::default());
        let (sink, stats) =
            run_reads_through(vec![make_runner(5, 2000, 4)], 400, vec![aln], Duration::from_millis(20));
        assert_eq!(sink.messages.lock().len(), 1);
        assert_eq!(stats.get("num_reads_in"), Some(&0.0));
    }

    #[test]
    fn test_restart_yields_identical_output() {
        let sink = CaptureSink::new(1024);
        let node = BasecallerNode::new(
            sink.clone(),
            vec![make_runner(5, 500, 8)],
            100,
            Duration::from_millis(20),
            64,
        )
        .unwrap();

        node.push_message(scaled_read("r1", 2600)).unwrap();
        node.terminate(&FlushOptions::default());
        let first: Vec<Vec<u8>> =
            sink.messages.lock().iter().map(|m| m.read_common().unwrap().seq.clone()).collect();

        sink.restart();
        sink.messages.lock().clear();
        node.restart();
        node.push_message(scaled_read("r1", 2600)).unwrap();
        node.terminate(&FlushOptions::default());
        let second: Vec<Vec<u8>> =
            sink.messages.lock().iter().map(|m| m.read_common().unwrap().seq.clone()).collect();

        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert!(!first[0].is_empty());
    }

    #[test]
    fn test_many_reads_multiple_runners_conservation() {
        let runners = vec![make_runner(5, 500, 8), make_runner(5, 500, 8)];
        let reads: Vec<Message> =
            (0..50).map(|i| scaled_read(&format!("r{i}"), 700 + (i % 7) * 330)).collect();
        let (sink, stats) = run_reads_through(runners, 100, reads, Duration::from_millis(10));
        assert_eq!(sink.messages.lock().len(), 50);
        assert_eq!(stats.get("num_reads_in"), Some(&50.0));
        assert_eq!(stats.get("num_reads_out"), Some(&50.0));
        assert_eq!(stats.get("reads_in_flight"), Some(&0.0));
    }
}
