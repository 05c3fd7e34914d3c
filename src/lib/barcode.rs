//! Barcode classification and trimming.
//!
//! Each read is scored against the barcodes of one or more kits in a window
//! at either end of the sequence. Classified reads get a barcode string; when
//! trimming is enabled the barcode (and its flanks, when confidently placed)
//! is removed from the sequence, qualities, move table, and modification
//! probabilities.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::{Result, SquallError};
use crate::messages::{BarcodeScoreResult, BarcodingInfo, Message, ReadCommon};
use crate::node::{send_to_sink, FlushOptions, NodeHandle, PipelineNode};
use crate::stats::NamedStats;
use crate::trim::{trim_modbase_probs, trim_move_table, trim_quality, trim_sequence};
use crate::work_queue::WorkQueue;

/// Barcode string for unclassified reads.
pub const UNCLASSIFIED: &str = "unclassified";

/// Flank confidence required before a barcode position drives trimming.
const FLANK_SCORE_THRES: f32 = 0.6;

/// Identity required for a barcode hit to classify a read.
const BARCODE_SCORE_THRES: f32 = 0.75;

/// Length of the search window at each end of the read.
const WINDOW_LEN: usize = 150;

/// Static description of one barcoding kit.
#[derive(Debug, Clone)]
pub struct KitInfo {
    /// Whether barcodes appear on both ends of the read.
    pub double_ends: bool,
    /// Prefix used to build the reported barcode string.
    pub prefix: &'static str,
    /// Barcode name/sequence pairs.
    pub barcodes: &'static [(&'static str, &'static str)],
}

const RBK_BARCODES: &[(&str, &str)] = &[
    ("BC01", "AAGAAAGTTGTCGGTGTCTTTGTG"),
    ("BC02", "TCGATTCCGTTTGTAGTCGTCTGT"),
    ("BC03", "GAGTCTTGTGTCCCAGTTACCAGG"),
    ("BC04", "TTCGGATTCTATCGTGTTTCCCTA"),
];

const RPB_BARCODES: &[(&str, &str)] = &[
    ("BC01", "AAGAAAGTTGTCGGTGTCTTTGTG"),
    ("BC02", "TCGATTCCGTTTGTAGTCGTCTGT"),
    ("BC03", "GAGTCTTGTGTCCCAGTTACCAGG"),
];

/// The kit table.
#[must_use]
pub fn kit_infos() -> &'static AHashMap<&'static str, KitInfo> {
    static KITS: std::sync::OnceLock<AHashMap<&'static str, KitInfo>> = std::sync::OnceLock::new();
    KITS.get_or_init(|| {
        let mut kits = AHashMap::new();
        kits.insert(
            "SQK-RBK004",
            KitInfo { double_ends: false, prefix: "RB", barcodes: RBK_BARCODES },
        );
        kits.insert(
            "SQK-RPB004",
            KitInfo { double_ends: true, prefix: "BC", barcodes: RPB_BARCODES },
        );
        kits
    })
}

/// Build the reported barcode string: kit prefix plus the barcode digits.
#[must_use]
pub fn generate_barcode_string(result: &BarcodeScoreResult) -> String {
    if result.barcode_name == UNCLASSIFIED {
        return UNCLASSIFIED.to_string();
    }
    let digits: String = result.barcode_name.chars().filter(char::is_ascii_digit).collect();
    let prefix = kit_infos().get(result.kit.as_str()).map_or("BC", |k| k.prefix);
    format!("{prefix}{digits}")
}

/// Best identity of `barcode` within `window`, with its start offset.
fn best_hit(window: &[u8], barcode: &[u8]) -> Option<(f32, usize)> {
    if barcode.is_empty() || window.len() < barcode.len() {
        return None;
    }
    let mut best = (0.0f32, 0usize);
    for offset in 0..=(window.len() - barcode.len()) {
        let matches = window[offset..offset + barcode.len()]
            .iter()
            .zip(barcode)
            .filter(|(a, b)| a == b)
            .count();
        let score = matches as f32 / barcode.len() as f32;
        if score > best.0 {
            best = (score, offset);
        }
    }
    Some(best)
}

/// Score one read against one kit.
#[must_use]
pub fn classify(seq: &[u8], kit_name: &str, barcode_both_ends: bool) -> BarcodeScoreResult {
    let kits = kit_infos();
    let Some(kit) = kits.get(kit_name) else {
        return BarcodeScoreResult::unclassified();
    };

    let top_window = &seq[..seq.len().min(WINDOW_LEN)];
    let bottom_start = seq.len().saturating_sub(WINDOW_LEN);
    let bottom_window = &seq[bottom_start..];

    let mut best: Option<BarcodeScoreResult> = None;
    for &(name, barcode) in kit.barcodes {
        let bytes = barcode.as_bytes();
        let top = best_hit(top_window, bytes);
        let bottom = if kit.double_ends { best_hit(bottom_window, bytes) } else { None };

        let top_score = top.map_or(0.0, |(s, _)| s);
        let bottom_score = bottom.map_or(0.0, |(s, _)| s);
        let use_top = top_score >= bottom_score;
        let winner = top_score.max(bottom_score);
        if best.as_ref().map_or(true, |b| winner > b.top_flank_score.max(b.bottom_flank_score)) {
            let top_pos = top.map_or((0, 0), |(_, o)| (o, o + bytes.len() - 1));
            let bottom_pos = bottom
                .map_or((0, 0), |(_, o)| (bottom_start + o, bottom_start + o + bytes.len() - 1));
            best = Some(BarcodeScoreResult {
                kit: kit_name.to_string(),
                barcode_name: name.to_string(),
                top_flank_score: top_score,
                bottom_flank_score: bottom_score,
                top_barcode_pos: top_pos,
                bottom_barcode_pos: bottom_pos,
                use_top,
            });
        }
    }

    match best {
        Some(result)
            if result.top_flank_score.max(result.bottom_flank_score) >= BARCODE_SCORE_THRES =>
        {
            let needs_both = barcode_both_ends && kit.double_ends;
            if needs_both
                && result.top_flank_score.min(result.bottom_flank_score) < BARCODE_SCORE_THRES
            {
                BarcodeScoreResult::unclassified()
            } else {
                result
            }
        }
        _ => BarcodeScoreResult::unclassified(),
    }
}

/// Compute the base interval to KEEP after barcode trimming.
///
/// The interval starts as the whole read. A confidently placed top barcode
/// advances the start to just past its end; for double-ended kits a
/// confidently placed bottom barcode retracts the end to its start. A
/// degenerate result falls back to the interval of whichever window was
/// actually used, and failing that the read is left untrimmed.
#[must_use]
pub fn determine_trim_interval(result: &BarcodeScoreResult, seqlen: usize) -> (usize, usize) {
    let whole = (0, seqlen);
    if result.kit == UNCLASSIFIED {
        return whole;
    }
    let kits = kit_infos();
    let double_ends = kits.get(result.kit.as_str()).is_some_and(|k| k.double_ends);

    let mut interval = whole;
    if result.top_flank_score > FLANK_SCORE_THRES {
        interval.0 = result.top_barcode_pos.1 + 1;
    }
    if double_ends {
        if result.bottom_flank_score > FLANK_SCORE_THRES {
            interval.1 = result.bottom_barcode_pos.0;
        }
        if interval.1 <= interval.0 {
            // The front and rear windows overlap on a very short read; keep
            // only the window that was actually used.
            return if result.use_top {
                (result.top_barcode_pos.0, result.top_barcode_pos.1 + 1)
            } else {
                (result.bottom_barcode_pos.0, result.bottom_barcode_pos.1 + 1)
            };
        }
    }
    if interval.1 <= interval.0 {
        return whole;
    }
    interval
}

/// Apply a keep-interval to every trimmable component of a read.
pub fn trim_read(common: &mut ReadCommon, interval: (usize, usize)) {
    if interval == (0, common.seq.len()) {
        return;
    }
    common.seq = trim_sequence(&common.seq, interval);
    common.qstring = trim_quality(&common.qstring, interval);
    let (positions_trimmed, moves) = trim_move_table(&common.moves, interval);
    common.moves = moves;
    common.num_trimmed_samples += common.model_stride * positions_trimmed;
    if let (Some(probs), Some(info)) = (&common.base_mod_probs, &common.mod_base_info) {
        common.base_mod_probs = Some(trim_modbase_probs(probs, interval, info.channel_count));
    }
}

struct Inner {
    input: WorkQueue<Message>,
    sink: NodeHandle,
    default_info: Option<BarcodingInfo>,
    num_barcodes_demuxed: AtomicU64,
}

impl Inner {
    fn barcoding_info<'a>(&'a self, common: &'a ReadCommon) -> Option<&'a BarcodingInfo> {
        if self.default_info.as_ref().is_some_and(|i| !i.kit_name.is_empty()) {
            return self.default_info.as_ref();
        }
        common.barcoding_info.as_ref().filter(|i| !i.kit_name.is_empty())
    }

    fn barcode_read(&self, common: &mut ReadCommon) {
        let Some(info) = self.barcoding_info(common).cloned() else {
            return;
        };
        let result = classify(&common.seq, &info.kit_name, info.barcode_both_ends);
        common.barcode = Some(generate_barcode_string(&result));
        common.pre_trim_seq_length = common.seq.len();
        if info.trim {
            let interval = determine_trim_interval(&result, common.seq.len());
            common.barcode_trim_interval = Some(interval);
            trim_read(common, interval);
        }
        common.barcoding_result = Some(result);
        self.num_barcodes_demuxed.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_loop(&self) {
        while let Some(mut msg) = self.input.pop() {
            if let Some(common) = msg.read_common_mut() {
                self.barcode_read(common);
            }
            send_to_sink(&self.sink, msg);
        }
    }
}

/// Worker-pool node classifying and trimming barcodes.
pub struct BarcodeClassifierNode {
    inner: Arc<Inner>,
    num_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BarcodeClassifierNode {
    #[must_use]
    pub fn new(
        sink: NodeHandle,
        default_info: Option<BarcodingInfo>,
        num_threads: usize,
        queue_capacity: usize,
    ) -> Self {
        let node = Self {
            inner: Arc::new(Inner {
                input: WorkQueue::new(queue_capacity),
                sink,
                default_info,
                num_barcodes_demuxed: AtomicU64::new(0),
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
                    .name(format!("barcoder_{i}"))
                    .spawn(move || inner.worker_loop())
                    .expect("failed to spawn barcoder thread"),
            );
        }
    }
}

impl PipelineNode for BarcodeClassifierNode {
    fn name(&self) -> &'static str {
        "barcode_classifier"
    }

    fn push_message(&self, msg: Message) -> Result<()> {
        self.inner.input.push(msg).map_err(|_| SquallError::QueueTerminated)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "num_barcodes_demuxed".to_string(),
            self.inner.num_barcodes_demuxed.load(Ordering::Relaxed) as f64,
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
