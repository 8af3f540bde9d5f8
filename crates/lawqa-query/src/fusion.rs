//! Normalized linear fusion of lexical and dense rankings.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use lawqa_core::{
    AlphaTable, Normalization, QaError, QueryPattern, Result, RetrievalConfig, ScoreOrigin,
    ScoredCandidate,
};

/// Normalize one ranking's scores into [0, 1].
///
/// Duplicate ids keep their best raw score and non-finite scores are
/// dropped. A ranking with a single entry, or with all scores equal,
/// normalizes to 1.0 everywhere. The result is ordered by normalized score
/// descending, ties by id.
pub fn normalize(ranking: &[ScoredCandidate], method: Normalization) -> Vec<(String, f32)> {
    let mut best: HashMap<&str, f32> = HashMap::new();
    for c in ranking.iter().filter(|c| c.score.is_finite()) {
        best.entry(c.passage_id.as_str())
            .and_modify(|s| *s = s.max(c.score))
            .or_insert(c.score);
    }

    let mut entries: Vec<(String, f32)> = best
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let Some(max) = entries.first().map(|e| e.1) else {
        return entries;
    };
    let min = entries.last().map(|e| e.1).unwrap_or(max);
    let range = max - min;
    if entries.len() == 1 || range <= 0.0 {
        for e in &mut entries {
            e.1 = 1.0;
        }
        return entries;
    }

    match method {
        Normalization::MinMax => {
            for e in &mut entries {
                e.1 = (e.1 - min) / range;
            }
        }
        Normalization::Rank => {
            // Dense ranking: equal raw scores share a rank.
            let n = entries.len() as f32;
            let mut rank = 0usize;
            let mut previous = entries[0].1;
            for e in &mut entries {
                if e.1 != previous {
                    rank += 1;
                    previous = e.1;
                }
                e.1 = 1.0 - rank as f32 / n;
            }
        }
    }
    entries
}

/// Combine normalized rankings as `α·dense + (1 − α)·lexical`.
///
/// Every id in either ranking is scored, with 0 for a missing side. Output
/// is sorted by fused score descending, ties by passage id.
pub fn fuse_scores(
    lexical: &[(String, f32)],
    dense: &[(String, f32)],
    alpha: f32,
) -> Vec<ScoredCandidate> {
    let mut parts: HashMap<&str, (f32, f32)> = HashMap::new();
    for (id, score) in lexical {
        parts.entry(id.as_str()).or_default().0 = *score;
    }
    for (id, score) in dense {
        parts.entry(id.as_str()).or_default().1 = *score;
    }

    let mut fused: Vec<ScoredCandidate> = parts
        .into_iter()
        .map(|(id, (lex, den))| {
            ScoredCandidate::new(id, alpha * den + (1.0 - alpha) * lex, ScoreOrigin::Fused)
        })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.passage_id.cmp(&b.passage_id))
    });
    fused
}

/// Result of fusing one query's rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    /// Weight applied to the dense side.
    pub alpha: f32,

    /// True when no passage appeared in both rankings.
    pub cold: bool,

    /// Fused candidates, best first, at most `initial_k`.
    pub candidates: Vec<ScoredCandidate>,
}

/// Hybrid fusion with a per-pattern dense weight.
#[derive(Debug, Clone)]
pub struct HybridFusion {
    initial_k: usize,
    base_alpha: f32,
    alpha: AlphaTable,
    normalization: Normalization,
}

impl HybridFusion {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            initial_k: config.initial_k,
            base_alpha: config.base_alpha,
            alpha: config.alpha,
            normalization: config.normalization,
        }
    }

    /// Fuse a lexical and a dense ranking for a question of `pattern`.
    ///
    /// The pattern's α applies when at least one passage is in both
    /// rankings; otherwise the base α does. Two empty rankings give an
    /// empty result.
    pub fn fuse(
        &self,
        lexical: &[ScoredCandidate],
        dense: &[ScoredCandidate],
        pattern: QueryPattern,
    ) -> Result<FusionOutcome> {
        check_origin(lexical, ScoreOrigin::Lexical)?;
        check_origin(dense, ScoreOrigin::Dense)?;

        let lexical = normalize(lexical, self.normalization);
        let dense = normalize(dense, self.normalization);

        let lexical_ids: HashSet<&str> = lexical.iter().map(|(id, _)| id.as_str()).collect();
        let cold = !dense.iter().any(|(id, _)| lexical_ids.contains(id.as_str()));
        let alpha = if cold {
            self.base_alpha
        } else {
            self.alpha.alpha_for(pattern)
        };

        let mut candidates = fuse_scores(&lexical, &dense, alpha);
        candidates.truncate(self.initial_k);

        debug!(
            "Fused {} lexical + {} dense into {} candidates (pattern={}, alpha={}, cold={})",
            lexical.len(),
            dense.len(),
            candidates.len(),
            pattern,
            alpha,
            cold
        );

        Ok(FusionOutcome {
            alpha,
            cold,
            candidates,
        })
    }
}

fn check_origin(ranking: &[ScoredCandidate], expected: ScoreOrigin) -> Result<()> {
    match ranking.iter().find(|c| c.origin != expected) {
        Some(c) => Err(QaError::invalid_argument(format!(
            "expected a {} ranking, got a {} score for passage {}",
            expected, c.origin, c.passage_id
        ))),
        None => Ok(()),
    }
}
