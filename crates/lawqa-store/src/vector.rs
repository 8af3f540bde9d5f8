//! Vector helpers shared by the store backends.

use lawqa_core::{ScoreOrigin, ScoredCandidate};

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sort by score descending, ties by id ascending, and keep the best `k`.
///
/// Non-finite scores are dropped.
pub(crate) fn top_k(scores: Vec<(String, f32)>, k: usize, origin: ScoreOrigin) -> Vec<ScoredCandidate> {
    let mut scores: Vec<_> = scores.into_iter().filter(|(_, s)| s.is_finite()).collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scores.truncate(k);
    scores
        .into_iter()
        .map(|(id, score)| ScoredCandidate::new(id, score, origin))
        .collect()
}

/// Convert f32 vector to bytes (little-endian).
pub(crate) fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert little-endian bytes back to an f32 vector.
pub(crate) fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
