//! Cross-encoder reranking stage.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use lawqa_core::{QaError, RankedPassage, Reranker, Result, RetrievalConfig};

/// Reranked passages, or fused order when the reranker was bypassed.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub passages: Vec<RankedPassage>,
    pub degraded: bool,
}

/// Scores fused candidates against the question and keeps the best
/// `final_k`.
///
/// Pairs are sent in batches of the model's `max_batch`, each under the
/// rerank timeout. Output is ordered by reranker score descending with
/// NaN last, ties broken by fused rank.
pub struct RerankStage<R> {
    reranker: Arc<R>,
    final_k: usize,
    timeout: Duration,
    degraded_mode: bool,
}

impl<R> RerankStage<R>
where
    R: Reranker,
{
    pub fn new(reranker: Arc<R>, config: &RetrievalConfig) -> Self {
        Self {
            reranker,
            final_k: config.final_k,
            timeout: config.rerank_timeout(),
            degraded_mode: config.degraded_rerank,
        }
    }

    /// Rerank candidates given in fused order.
    ///
    /// Duplicate passage ids are dropped, keeping the first. When the model
    /// fails and degraded mode is off the error is `RerankUnavailable`.
    pub async fn rerank(
        &self,
        question: &str,
        candidates: Vec<RankedPassage>,
    ) -> Result<RerankOutcome> {
        let mut seen = HashSet::new();
        let candidates: Vec<RankedPassage> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.passage.id.clone()))
            .collect();

        if candidates.is_empty() {
            return Ok(RerankOutcome {
                passages: Vec::new(),
                degraded: false,
            });
        }

        let scores = match self.score_all(question, &candidates).await {
            Ok(scores) => scores,
            Err(e) if self.degraded_mode => {
                warn!("Reranker unavailable, returning fused order: {}", e);
                return Ok(RerankOutcome {
                    passages: self.fused_order(candidates),
                    degraded: true,
                });
            }
            Err(e) => return Err(e),
        };

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| descending_nan_last(scores[a], scores[b]).then(a.cmp(&b)));
        order.truncate(self.final_k);

        let mut slots: Vec<Option<RankedPassage>> = candidates.into_iter().map(Some).collect();
        let passages = order
            .into_iter()
            .enumerate()
            .filter_map(|(rank, i)| {
                slots[i].take().map(|mut p| {
                    p.rank = rank as u32 + 1;
                    p.rerank_score = Some(scores[i]);
                    p
                })
            })
            .collect();

        Ok(RerankOutcome {
            passages,
            degraded: false,
        })
    }

    async fn score_all(&self, question: &str, candidates: &[RankedPassage]) -> Result<Vec<f32>> {
        let batch = self.reranker.max_batch().max(1);
        let mut scores = Vec::with_capacity(candidates.len());

        for chunk in candidates.chunks(batch) {
            let texts: Vec<&str> = chunk
                .iter()
                .map(|c| c.passage.enriched_text.as_str())
                .collect();

            let batch_scores =
                match tokio::time::timeout(self.timeout, self.reranker.score_pairs(question, &texts))
                    .await
                {
                    Ok(Ok(s)) => s,
                    Ok(Err(e @ QaError::RerankUnavailable { .. })) => return Err(e),
                    Ok(Err(e)) => return Err(QaError::rerank_unavailable(e.to_string())),
                    Err(_) => {
                        return Err(QaError::rerank_unavailable(format!(
                            "timed out after {}ms",
                            self.timeout.as_millis()
                        )))
                    }
                };

            if batch_scores.len() != chunk.len() {
                return Err(QaError::rerank_unavailable(format!(
                    "expected {} scores, got {}",
                    chunk.len(),
                    batch_scores.len()
                )));
            }
            scores.extend(batch_scores);
        }

        debug!("Reranked {} candidates in batches of {}", scores.len(), batch);
        Ok(scores)
    }

    fn fused_order(&self, mut candidates: Vec<RankedPassage>) -> Vec<RankedPassage> {
        candidates.truncate(self.final_k);
        for (i, c) in candidates.iter_mut().enumerate() {
            c.rank = i as u32 + 1;
            c.rerank_score = None;
        }
        candidates
    }
}

fn descending_nan_last(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use lawqa_core::{Passage, PassageBuilder};

    use super::*;

    fn passage(id: &str, text: &str) -> Passage {
        PassageBuilder::new(id, "Luật số 36/2024/QH15", "1")
            .text(text)
            .build()
            .unwrap()
    }

    fn candidates(ids: &[&str]) -> Vec<RankedPassage> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedPassage {
                rank: i as u32 + 1,
                passage: passage(id, &format!("nội dung {}", id)),
                fused_score: 1.0 - i as f32 * 0.01,
                rerank_score: None,
            })
            .collect()
    }

    fn ids(passages: &[RankedPassage]) -> Vec<&str> {
        passages.iter().map(|p| p.passage.id.as_str()).collect()
    }

    /// Scores each text by a lookup on its last word; records batch sizes.
    struct TableReranker {
        scores: HashMap<String, f32>,
        batches: Mutex<Vec<usize>>,
        max_batch: usize,
    }

    impl TableReranker {
        fn new(scores: &[(&str, f32)], max_batch: usize) -> Self {
            Self {
                scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                batches: Mutex::new(Vec::new()),
                max_batch,
            }
        }
    }

    #[async_trait]
    impl Reranker for TableReranker {
        async fn score_pairs(&self, _question: &str, passages: &[&str]) -> Result<Vec<f32>> {
            self.batches.lock().unwrap().push(passages.len());
            Ok(passages
                .iter()
                .map(|p| {
                    let key = p.split_whitespace().last().unwrap_or_default();
                    self.scores.get(key).copied().unwrap_or(0.0)
                })
                .collect())
        }

        fn max_batch(&self) -> usize {
            self.max_batch
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn score_pairs(&self, _question: &str, _passages: &[&str]) -> Result<Vec<f32>> {
            Err(QaError::internal("model crashed"))
        }
    }

    struct ShortReranker;

    #[async_trait]
    impl Reranker for ShortReranker {
        async fn score_pairs(&self, _question: &str, passages: &[&str]) -> Result<Vec<f32>> {
            Ok(vec![0.5; passages.len().saturating_sub(1)])
        }
    }

    struct SlowReranker;

    #[async_trait]
    impl Reranker for SlowReranker {
        async fn score_pairs(&self, _question: &str, passages: &[&str]) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0; passages.len()])
        }
    }

    fn stage<R: Reranker>(reranker: R, degraded: bool) -> RerankStage<R> {
        RerankStage::new(
            Arc::new(reranker),
            &RetrievalConfig {
                degraded_rerank: degraded,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_orders_by_score_and_truncates() {
        let reranker = TableReranker::new(
            &[("a", 0.1), ("b", 0.9), ("c", 0.5), ("d", 0.7), ("e", 0.2), ("f", 0.8)],
            16,
        );
        let out = stage(reranker, false)
            .rerank("câu hỏi", candidates(&["a", "b", "c", "d", "e", "f"]))
            .await
            .unwrap();

        assert!(!out.degraded);
        assert_eq!(ids(&out.passages), vec!["b", "f", "d", "c", "e"]);
        let ranks: Vec<u32> = out.passages.iter().map(|p| p.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert_eq!(out.passages[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_ties_keep_fused_order_and_nan_last() {
        let reranker = TableReranker::new(&[("a", f32::NAN), ("b", 0.4), ("c", 0.4)], 16);
        let out = stage(reranker, false)
            .rerank("q", candidates(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(ids(&out.passages), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_subset_without_duplicates() {
        let reranker = TableReranker::new(&[("a", 0.3), ("b", 0.6)], 16);
        let input = candidates(&["a", "b", "a", "b", "a"]);
        let input_ids: HashSet<String> = input.iter().map(|c| c.passage.id.clone()).collect();

        let out = stage(reranker, false).rerank("q", input).await.unwrap();
        assert_eq!(ids(&out.passages), vec!["b", "a"]);
        assert!(out.passages.len() <= 5);
        assert!(out.passages.iter().all(|p| input_ids.contains(&p.passage.id)));
    }

    #[tokio::test]
    async fn test_batches_by_max_batch() {
        let reranker = Arc::new(TableReranker::new(&[], 4));
        let stage = RerankStage::new(Arc::clone(&reranker), &RetrievalConfig::default());
        let names: Vec<String> = (0..10).map(|i| format!("p{:02}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();

        let out = stage.rerank("q", candidates(&names)).await.unwrap();
        assert_eq!(*reranker.batches.lock().unwrap(), vec![4, 4, 2]);
        // All scores tie at zero: fused order is kept.
        assert_eq!(ids(&out.passages), vec!["p00", "p01", "p02", "p03", "p04"]);
    }

    #[tokio::test]
    async fn test_empty_input_skips_model() {
        let reranker = Arc::new(TableReranker::new(&[], 16));
        let stage = RerankStage::new(Arc::clone(&reranker), &RetrievalConfig::default());
        let out = stage.rerank("q", Vec::new()).await.unwrap();
        assert!(out.passages.is_empty());
        assert!(reranker.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_rerank_unavailable() {
        let err = stage(FailingReranker, false)
            .rerank("q", candidates(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_wrong_score_count_is_rerank_unavailable() {
        let err = stage(ShortReranker, false)
            .rerank("q", candidates(&["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_rerank_unavailable() {
        let err = stage(SlowReranker, false)
            .rerank("q", candidates(&["a"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_degraded_mode_returns_fused_order() {
        let names = ["a", "b", "c", "d", "e", "f", "g"];
        let out = stage(FailingReranker, true)
            .rerank("q", candidates(&names))
            .await
            .unwrap();
        assert!(out.degraded);
        assert_eq!(ids(&out.passages), vec!["a", "b", "c", "d", "e"]);
        assert!(out.passages.iter().all(|p| p.rerank_score.is_none()));
    }
}
