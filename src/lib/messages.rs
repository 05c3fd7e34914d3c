//! Message types passed between pipeline nodes.
//!
//! All inter-node traffic is a single tagged union, [`Message`]. Ownership of
//! the payload transfers with the message: whichever node holds a message
//! exclusively owns the read or record inside it. Nodes dispatch exhaustively
//! and forward variants they do not handle unchanged, so new variants survive
//! pass-through stages.

use crate::sam::SamRecord;

/// Descriptor for the modified-base channels attached to a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModBaseInfo {
    /// Concatenated channel alphabet, e.g. `"hm"` for 5hmC + 5mC on C.
    pub alphabet: String,
    /// Canonical bases targeted per channel, aligned with `alphabet`.
    pub canonical_bases: String,
    /// Number of probability channels per base position.
    pub channel_count: usize,
}

/// Per-read barcoding request attached by the loader or the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodingInfo {
    /// Barcoding kit to classify against.
    pub kit_name: String,
    /// Whether to demand barcodes on both ends of the read.
    pub barcode_both_ends: bool,
    /// Whether to trim the classified barcode from the read.
    pub trim: bool,
}

/// Output of running the barcoder against one read.
#[derive(Debug, Clone, PartialEq)]
pub struct BarcodeScoreResult {
    /// Kit the winning barcode belongs to, or `"unclassified"`.
    pub kit: String,
    /// Winning barcode name, or `"unclassified"`.
    pub barcode_name: String,
    /// Flank score at the read head, in `[0, 1]`.
    pub top_flank_score: f32,
    /// Flank score at the read tail, in `[0, 1]`.
    pub bottom_flank_score: f32,
    /// Inclusive base interval of the top barcode hit.
    pub top_barcode_pos: (usize, usize),
    /// Inclusive base interval of the bottom barcode hit.
    pub bottom_barcode_pos: (usize, usize),
    /// Whether the top window drove the classification.
    pub use_top: bool,
}

impl BarcodeScoreResult {
    /// An unclassified result.
    #[must_use]
    pub fn unclassified() -> Self {
        Self {
            kit: super::barcode::UNCLASSIFIED.to_string(),
            barcode_name: super::barcode::UNCLASSIFIED.to_string(),
            top_flank_score: 0.0,
            bottom_flank_score: 0.0,
            top_barcode_pos: (0, 0),
            bottom_barcode_pos: (0, 0),
            use_top: false,
        }
    }
}

/// Fields common to simplex and duplex reads.
///
/// The signal buffers shrink as the read moves down the pipeline: the scaler
/// populates `scaled_signal`, the basecaller consumes it and releases it, and
/// `ReadToBamType` finally drops `raw_signal`.
#[derive(Debug, Clone, Default)]
pub struct ReadCommon {
    /// Unique read identifier within a run.
    pub read_id: String,
    /// Raw 16-bit signal as loaded from disk; immutable after load.
    pub raw_signal: Vec<i16>,
    /// Normalized signal produced by the scaler.
    pub scaled_signal: Vec<f32>,
    /// Samples-per-base ratio of the current model.
    pub model_stride: usize,
    /// Called sequence over `{A,C,G,T}`.
    pub seq: Vec<u8>,
    /// ASCII (phred+33) qualities, same length as `seq`.
    pub qstring: Vec<u8>,
    /// One 0/1 entry per stride step; 1 marks a base emission.
    pub moves: Vec<u8>,
    /// Samples trimmed from the signal head.
    pub num_trimmed_samples: usize,
    /// Per-base modification probabilities, `seq.len() * channel_count` long.
    pub base_mod_probs: Option<Vec<u8>>,
    /// Channel descriptor for `base_mod_probs`.
    pub mod_base_info: Option<ModBaseInfo>,
    /// Barcoding request for this read, if any.
    pub barcoding_info: Option<BarcodingInfo>,
    /// Classification output, populated by the barcode node.
    pub barcoding_result: Option<BarcodeScoreResult>,
    /// Barcode string written to the `BC` tag.
    pub barcode: Option<String>,
    /// Half-open base interval retained by barcode trimming.
    pub barcode_trim_interval: Option<(usize, usize)>,
    /// Sequence length before barcode trimming.
    pub pre_trim_seq_length: usize,
    /// Estimated poly(A)/poly(T) tail length; -1 means unknown or failed.
    pub rna_poly_tail_length: i32,
    /// Read group identifier for the output header.
    pub read_group: String,
    /// Failure tag attached when a stage abandoned this read.
    pub failure: Option<&'static str>,
}

impl ReadCommon {
    /// Mean per-base quality, decoded from the phred+33 `qstring`.
    ///
    /// Returns 0.0 for an empty quality string.
    #[must_use]
    pub fn mean_qscore(&self) -> f32 {
        if self.qstring.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.qstring.iter().map(|&q| u64::from(q.saturating_sub(33))).sum();
        sum as f32 / self.qstring.len() as f32
    }
}

/// A single-strand read.
#[derive(Debug, Clone, Default)]
pub struct SimplexRead {
    pub common: ReadCommon,
}

/// A two-strand consensus read with provenance back to its parents.
#[derive(Debug, Clone, Default)]
pub struct DuplexRead {
    pub common: ReadCommon,
    /// Read ids of the template and complement strands.
    pub source_ids: (String, String),
}

/// Batched alignment info routed to error-correction consumers.
#[derive(Debug, Clone, Default)]
pub struct CorrectionAlignments {
    /// Target read the alignments pile up on.
    pub read_id: String,
    /// Query read ids aligned to the target.
    pub query_ids: Vec<String>,
    /// CIGAR strings, aligned with `query_ids`.
    pub cigars: Vec<String>,
}

/// The tagged union flowing through every work queue.
#[derive(Debug)]
pub enum Message {
    SimplexRead(Box<SimplexRead>),
    DuplexRead(Box<DuplexRead>),
    SamRecord(Box<SamRecord>),
    CorrectionAlignments(CorrectionAlignments),
}

impl Message {
    /// Shared read body, if this message carries a read.
    #[must_use]
    pub fn read_common(&self) -> Option<&ReadCommon> {
        match self {
            Message::SimplexRead(read) => Some(&read.common),
            Message::DuplexRead(read) => Some(&read.common),
            _ => None,
        }
    }

    /// Mutable shared read body, if this message carries a read.
    pub fn read_common_mut(&mut self) -> Option<&mut ReadCommon> {
        match self {
            Message::SimplexRead(read) => Some(&mut read.common),
            Message::DuplexRead(read) => Some(&mut read.common),
            _ => None,
        }
    }
}
