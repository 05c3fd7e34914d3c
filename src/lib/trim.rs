//! Trimming helpers shared by the barcode node.
//!
//! All functions take a half-open `[start, end)` base interval describing
//! the portion of the read to KEEP.

/// Keep `interval` of a byte sequence.
#[must_use]
pub fn trim_sequence(seq: &[u8], interval: (usize, usize)) -> Vec<u8> {
    let (start, end) = clamp(interval, seq.len());
    seq[start..end].to_vec()
}

/// Keep `interval` of a quality string.
#[must_use]
pub fn trim_quality(qual: &[u8], interval: (usize, usize)) -> Vec<u8> {
    trim_sequence(qual, interval)
}

/// Trim a move table to the kept base interval.
///
/// Returns `(positions_trimmed, trimmed_moves)` where `positions_trimmed` is
/// the number of leading stride steps removed; the caller accounts for them
/// as `model_stride * positions_trimmed` extra trimmed samples. The trimmed
/// table starts at the move bit of the first kept base and ends just before
/// the move bit of the first base past the interval.
#[must_use]
pub fn trim_move_table(moves: &[u8], interval: (usize, usize)) -> (usize, Vec<u8>) {
    let (start, end) = interval;
    let mut base_idx = 0usize;
    let mut step_start = 0usize;
    let mut step_end = moves.len();
    let mut seen_start = start == 0 && end == 0;
    for (step, &mv) in moves.iter().enumerate() {
        if mv == 0 {
            continue;
        }
        if base_idx == start {
            step_start = step;
            seen_start = true;
        }
        if base_idx == end {
            step_end = step;
            break;
        }
        base_idx += 1;
    }
    if !seen_start || step_end < step_start {
        return (0, Vec::new());
    }
    (step_start, moves[step_start..step_end].to_vec())
}

/// Trim modification probabilities, scaling the interval by the channel
/// count (the table holds `channel_count` bytes per base).
#[must_use]
pub fn trim_modbase_probs(probs: &[u8], interval: (usize, usize), channel_count: usize) -> Vec<u8> {
    let scaled = (interval.0 * channel_count, interval.1 * channel_count);
    trim_sequence(probs, scaled)
}

fn clamp(interval: (usize, usize), len: usize) -> (usize, usize) {
    let start = interval.0.min(len);
    let end = interval.1.min(len).max(start);
    (start, end)
}
