//! Score decoding shared by every runner realization.
//!
//! Inference produces one score per stride step. Decoding collapses those
//! step scores into a called sequence: a step emits a base when its
//! quantized level differs from the previous step's, so repeated levels
//! collapse into a single call. The decode is a pure function of the scores,
//! which keeps pipeline output byte-stable across runs and restarts.

/// Base alphabet indexed by quantized level.
const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// Lowest phred value the decoder assigns.
const MIN_QSCORE: i32 = 2;
/// Highest phred value the decoder assigns.
const MAX_QSCORE: i32 = 50;

/// Sequence fragment decoded from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedChunk {
    /// Called bases for this chunk, in step order.
    pub seq: Vec<u8>,
    /// ASCII (phred+33) qualities, aligned with `seq`.
    pub qstring: Vec<u8>,
    /// One 0/1 entry per stride step; the number of 1s equals `seq.len()`.
    pub moves: Vec<u8>,
}

fn quantize(score: f32) -> i32 {
    (score * 4.0).round().clamp(-8.0, 8.0) as i32
}

fn qchar(score: f32) -> u8 {
    let phred = (8.0 + score.abs() * 12.0) as i32;
    (phred.clamp(MIN_QSCORE, MAX_QSCORE) + 33) as u8
}

/// Decode per-step scores into a `(seq, qstring, moves)` triple.
#[must_use]
pub fn decode_steps(scores: &[f32]) -> DecodedChunk {
    let mut decoded = DecodedChunk {
        seq: Vec::with_capacity(scores.len()),
        qstring: Vec::with_capacity(scores.len()),
        moves: vec![0u8; scores.len()],
    };
    let mut prev_level: Option<i32> = None;
    for (step, &score) in scores.iter().enumerate() {
        let level = quantize(score);
        if prev_level != Some(level) {
            decoded.moves[step] = 1;
            decoded.seq.push(BASES[level.rem_euclid(4) as usize]);
            decoded.qstring.push(qchar(score));
        }
        prev_level = Some(level);
    }
    decoded
}
