//! Retrieval engine for hybrid search over law passages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use lawqa_core::text::tokenize;
use lawqa_core::{
    Embedder, PassageStore, QaError, QueryPattern, RankedPassage, Reranker, Result,
    RetrievalConfig, RetrievalOutcome, ScoredCandidate,
};

use crate::classifier::QueryClassifier;
use crate::context::assemble_context;
use crate::fusion::HybridFusion;
use crate::rerank::RerankStage;

/// Hybrid retrieval pipeline.
///
/// Classifies the question, runs lexical and dense search concurrently,
/// fuses the rankings with a pattern-dependent α, reranks the fused
/// candidates with a cross-encoder and assembles a citation-annotated
/// context. Every store and model call carries a timeout.
pub struct RetrievalEngine<S, E, R> {
    /// Storage backend.
    store: Arc<S>,

    /// Embedding model.
    embedder: Arc<E>,

    classifier: QueryClassifier,
    fusion: HybridFusion,
    rerank: RerankStage<R>,
    config: RetrievalConfig,
}

impl<S, E, R> RetrievalEngine<S, E, R>
where
    S: PassageStore,
    E: Embedder,
    R: Reranker,
{
    /// Create a new engine. Fails if the configuration is out of range.
    pub fn new(
        store: Arc<S>,
        embedder: Arc<E>,
        reranker: Arc<R>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            embedder,
            classifier: QueryClassifier::new(),
            fusion: HybridFusion::new(&config),
            rerank: RerankStage::new(reranker, &config),
            config,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Classify a question without retrieving.
    pub fn classify(&self, question: &str) -> QueryPattern {
        self.classifier.classify(question)
    }

    /// Retrieve the best passages for a question.
    ///
    /// An outcome with `context == None` means nothing relevant was found;
    /// store, embedding and reranker failures are returned as errors.
    pub async fn retrieve(&self, question: &str) -> Result<RetrievalOutcome> {
        let start = Instant::now();

        let question = question.trim();
        if question.is_empty() {
            return Err(QaError::invalid_argument("question must not be empty"));
        }

        info!("Retrieving for: {:?}", question);

        let pattern = self.classifier.classify(question);
        let tokens = tokenize(question);
        let embedding = self.embed_question(question).await?;

        let fetch_k = self.config.fetch_k();
        let fields = &self.config.lexical_fields;
        let (lexical, dense) = tokio::join!(
            self.with_retry("lexical search", || self
                .store
                .search_lexical(&tokens, fields, fetch_k)),
            self.with_retry("dense search", || self.store.search_dense(&embedding, fetch_k))
        );
        let lexical = lexical?;
        let dense = dense?;

        debug!(
            "Lexical search returned {} results, dense search returned {} results",
            lexical.len(),
            dense.len()
        );

        let fused = self.fusion.fuse(&lexical, &dense, pattern)?;
        let candidates = self.load_candidates(&fused.candidates).await?;
        let reranked = self.rerank.rerank(question, candidates).await?;
        let context = assemble_context(&reranked.passages);

        let latency_ms = start.elapsed().as_millis() as u64;

        info!(
            "Retrieval completed in {}ms: pattern={}, alpha={}, {} passages{}",
            latency_ms,
            pattern,
            fused.alpha,
            reranked.passages.len(),
            if reranked.degraded { " (degraded)" } else { "" }
        );

        Ok(RetrievalOutcome {
            question: question.to_string(),
            pattern,
            alpha: fused.alpha,
            passages: reranked.passages,
            context,
            degraded: reranked.degraded,
            latency_ms,
        })
    }

    async fn embed_question(&self, question: &str) -> Result<Vec<f32>> {
        let timeout = self.config.search_timeout();
        match tokio::time::timeout(timeout, self.embedder.embed_query(question)).await {
            Ok(result) => result,
            Err(_) => Err(QaError::embedding_unavailable(format!(
                "query embedding timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Fetch fused candidates' passages, keeping fused order.
    async fn load_candidates(&self, fused: &[ScoredCandidate]) -> Result<Vec<RankedPassage>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = fused.iter().map(|c| c.passage_id.clone()).collect();
        let passages = self
            .with_retry("passage lookup", || self.store.get_passages(&ids))
            .await?;
        let mut by_id: HashMap<String, _> =
            passages.into_iter().map(|p| (p.id.clone(), p)).collect();

        let mut ranked = Vec::with_capacity(fused.len());
        for candidate in fused {
            match by_id.remove(&candidate.passage_id) {
                Some(passage) => ranked.push(RankedPassage {
                    rank: ranked.len() as u32 + 1,
                    passage,
                    fused_score: candidate.score,
                    rerank_score: None,
                }),
                None => debug!("Passage {} no longer in store, skipping", candidate.passage_id),
            }
        }
        Ok(ranked)
    }

    /// Run a store call under the search timeout, retrying `StoreUnavailable`
    /// up to `max_retries` times.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.search_timeout();
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(QaError::store_unavailable(
                    operation,
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };

            match result {
                Err(e @ QaError::StoreUnavailable { .. }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} failed, retrying ({}/{}): {}",
                        operation, attempt, self.config.max_retries, e
                    );
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use lawqa_core::{LexicalField, Passage, PassageBuilder, Stats};
    use lawqa_embed::{KeywordOverlapReranker, MockEmbedder, UnavailableReranker};
    use lawqa_store::{MemoryStore, SqliteStore};

    use super::*;

    const LAW: &str = "Luật số 36/2024/QH15";

    fn passage(id: &str, article: &str, title: &str, clause: &str, text: &str) -> Passage {
        PassageBuilder::new(id, LAW, article)
            .chapter("Chương II. Quy tắc giao thông đường bộ")
            .article_title(title)
            .clause(clause, "")
            .text(text)
            .build()
            .unwrap()
    }

    fn corpus() -> Vec<Passage> {
        vec![
            passage(
                "d5k1",
                "5",
                "Tốc độ và khoảng cách",
                "1",
                "Tốc độ tối đa cho phép đối với xe ô tô trên đường cao tốc là 120 km/h.",
            ),
            passage(
                "d5k2",
                "5",
                "Tốc độ và khoảng cách",
                "2",
                "Người lái xe phải tuân thủ tốc độ tối đa ghi trên biển báo hiệu.",
            ),
            passage(
                "d5k3",
                "5",
                "Tốc độ và khoảng cách",
                "3",
                "Trong khu dân cư, tốc độ tối đa là 60 km/h đối với đường đôi.",
            ),
            passage(
                "d6k1",
                "6",
                "Xử phạt vi phạm tốc độ",
                "1",
                "Phạt tiền từ 800.000 đồng đến 1.000.000 đồng khi vượt quá tốc độ từ 5 km/h đến dưới 10 km/h.",
            ),
            passage(
                "d6k2",
                "6",
                "Xử phạt vi phạm tốc độ",
                "2",
                "Phạt tiền từ 4.000.000 đồng đến 6.000.000 đồng khi vượt quá tốc độ từ 10 km/h đến 20 km/h.",
            ),
            passage(
                "d7k1",
                "7",
                "Kết cấu hạ tầng đường bộ",
                "1",
                "Kết cấu hạ tầng đường bộ bao gồm đường bộ, công trình đường bộ và hành lang an toàn.",
            ),
            passage(
                "d8k1",
                "8",
                "Mũ bảo hiểm",
                "1",
                "Người đi xe mô tô phải đội mũ bảo hiểm và cài quai đúng quy cách.",
            ),
            passage(
                "d9k1",
                "9",
                "Giảm tốc độ",
                "1",
                "Người điều khiển xe phải giảm tốc độ khi đi qua nơi đông người.",
            ),
        ]
    }

    async fn embedded_corpus(embedder: &MockEmbedder) -> Vec<Passage> {
        let mut passages = corpus();
        let texts: Vec<&str> = passages.iter().map(|p| p.enriched_text.as_str()).collect();
        let vectors = embedder.embed_documents(&texts).await.unwrap();
        for (p, v) in passages.iter_mut().zip(vectors) {
            p.embedding = v;
        }
        passages
    }

    async fn engine_with<R: Reranker>(
        reranker: R,
        config: RetrievalConfig,
    ) -> RetrievalEngine<MemoryStore, MockEmbedder, R> {
        let embedder = MockEmbedder::new(256);
        let store = MemoryStore::with_passages(embedded_corpus(&embedder).await).unwrap();
        RetrievalEngine::new(
            Arc::new(store),
            Arc::new(embedder),
            Arc::new(reranker),
            config,
        )
        .unwrap()
    }

    async fn engine() -> RetrievalEngine<MemoryStore, MockEmbedder, KeywordOverlapReranker> {
        engine_with(KeywordOverlapReranker::new(), RetrievalConfig::default()).await
    }

    /// Counts reranker calls and scores everything equally.
    #[derive(Default)]
    struct CountingReranker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reranker for CountingReranker {
        async fn score_pairs(&self, _question: &str, passages: &[&str]) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; passages.len()])
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn score_pairs(&self, _question: &str, _passages: &[&str]) -> Result<Vec<f32>> {
            Err(QaError::rerank_unavailable("connection refused"))
        }
    }

    /// Wraps a store with scripted lexical failures, a hanging dense
    /// search, or a lexical hit for a passage that does not exist.
    struct FlakyStore {
        inner: MemoryStore,
        lexical_failures: usize,
        lexical_error: fn() -> QaError,
        lexical_calls: AtomicUsize,
        dense_hangs: bool,
        ghost_hit: bool,
    }

    impl FlakyStore {
        async fn new() -> Self {
            let embedder = MockEmbedder::new(256);
            Self {
                inner: MemoryStore::with_passages(embedded_corpus(&embedder).await).unwrap(),
                lexical_failures: 0,
                lexical_error: || QaError::store_unavailable("lexical search", "connection reset"),
                lexical_calls: AtomicUsize::new(0),
                dense_hangs: false,
                ghost_hit: false,
            }
        }
    }

    #[async_trait]
    impl PassageStore for FlakyStore {
        async fn insert_passages(&self, passages: &[Passage]) -> Result<()> {
            self.inner.insert_passages(passages).await
        }

        async fn get_passage(&self, id: &str) -> Result<Option<Passage>> {
            self.inner.get_passage(id).await
        }

        async fn get_passages(&self, ids: &[String]) -> Result<Vec<Passage>> {
            self.inner.get_passages(ids).await
        }

        async fn search_lexical(
            &self,
            tokens: &[String],
            fields: &[LexicalField],
            k: usize,
        ) -> Result<Vec<ScoredCandidate>> {
            let call = self.lexical_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.lexical_failures {
                return Err((self.lexical_error)());
            }
            let mut results = self.inner.search_lexical(tokens, fields, k).await?;
            if self.ghost_hit {
                results.insert(0, ScoredCandidate::lexical("ghost", 100.0));
            }
            Ok(results)
        }

        async fn search_dense(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredCandidate>> {
            if self.dense_hangs {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.search_dense(embedding, k).await
        }

        async fn stats(&self) -> Result<Stats> {
            self.inner.stats().await
        }
    }

    fn flaky_engine(
        store: FlakyStore,
    ) -> RetrievalEngine<FlakyStore, MockEmbedder, KeywordOverlapReranker> {
        RetrievalEngine::new(
            Arc::new(store),
            Arc::new(MockEmbedder::new(256)),
            Arc::new(KeywordOverlapReranker::new()),
            RetrievalConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_explicit_citation_scenario() {
        let engine = engine().await;
        let outcome = engine
            .retrieve("Điều 5 quy định gì về tốc độ tối đa?")
            .await
            .unwrap();

        assert_eq!(outcome.pattern, QueryPattern::ExplicitCitation);
        assert_eq!(outcome.alpha, 0.30);
        assert!(!outcome.degraded);
        assert!(outcome.passages.len() <= 5);

        let top3: Vec<&str> = outcome
            .passages
            .iter()
            .take(3)
            .map(|p| p.passage.article_no.as_str())
            .collect();
        assert_eq!(top3, vec!["5", "5", "5"]);

        let context = outcome.context.unwrap();
        assert_eq!(context.citations.len(), outcome.passages.len());
        assert!(context.citations[0].contains("Điều 5"));
        assert!(context.context.starts_with("[Căn cứ: "));
    }

    #[tokio::test]
    async fn test_numeric_threshold_scenario() {
        let engine = engine().await;
        let outcome = engine
            .retrieve("phạt bao nhiêu tiền khi vượt 10km/h")
            .await
            .unwrap();

        assert_eq!(outcome.pattern, QueryPattern::NumericThreshold);
        assert_eq!(outcome.alpha, 0.40);
        assert_eq!(outcome.passages[0].passage.article_no, "6");
    }

    #[tokio::test]
    async fn test_semantic_scenario() {
        let engine = engine().await;
        let outcome = engine
            .retrieve("kết cấu hạ tầng đường bộ bao gồm những gì")
            .await
            .unwrap();

        assert_eq!(outcome.pattern, QueryPattern::Semantic);
        assert_eq!(outcome.alpha, 0.75);
        assert_eq!(outcome.passages[0].passage.id, "d7k1");
    }

    #[tokio::test]
    async fn test_empty_store_gives_no_context() {
        let reranker = Arc::new(CountingReranker::default());
        let engine = RetrievalEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockEmbedder::new(256)),
            Arc::clone(&reranker),
            RetrievalConfig::default(),
        )
        .unwrap();

        let outcome = engine.retrieve("tốc độ tối đa").await.unwrap();
        assert!(outcome.passages.is_empty());
        assert!(outcome.context.is_none());
        assert!(outcome.is_empty());
        assert_eq!(reranker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let engine = engine().await;
        let err = engine.retrieve("   ").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let engine = engine().await;
        let q = "người lái xe phải giảm tốc độ khi nào";
        let first = engine.retrieve(q).await.unwrap();
        let second = engine.retrieve(q).await.unwrap();

        let summary = |o: &RetrievalOutcome| -> Vec<(String, f32, Option<f32>)> {
            o.passages
                .iter()
                .map(|p| (p.passage.id.clone(), p.fused_score, p.rerank_score))
                .collect()
        };
        assert_eq!(summary(&first), summary(&second));
        assert_eq!(first.context, second.context);
    }

    #[tokio::test]
    async fn test_output_has_no_duplicates_and_respects_final_k() {
        let engine = engine_with(
            KeywordOverlapReranker::new(),
            RetrievalConfig {
                final_k: 3,
                ..Default::default()
            },
        )
        .await;
        let outcome = engine.retrieve("xe ô tô tốc độ").await.unwrap();
        assert!(outcome.passages.len() <= 3);

        let mut ids: Vec<&str> = outcome.passages.iter().map(|p| p.passage.id.as_str()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[tokio::test]
    async fn test_rerank_unavailable_propagates() {
        let engine = engine_with(FailingReranker, RetrievalConfig::default()).await;
        let err = engine.retrieve("tốc độ tối đa").await.unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_degraded_rerank_is_flagged() {
        let engine = engine_with(
            FailingReranker,
            RetrievalConfig {
                degraded_rerank: true,
                ..Default::default()
            },
        )
        .await;
        let outcome = engine.retrieve("tốc độ tối đa").await.unwrap();
        assert!(outcome.degraded);
        assert!(!outcome.passages.is_empty());
        assert!(outcome.passages.iter().all(|p| p.rerank_score.is_none()));
        assert!(outcome.context.is_some());
    }

    #[tokio::test]
    async fn test_missing_reranker_model_degrades() {
        let engine = engine_with(
            UnavailableReranker::new("model not found"),
            RetrievalConfig {
                degraded_rerank: true,
                ..Default::default()
            },
        )
        .await;
        let outcome = engine.retrieve("Điều 8 quy định gì").await.unwrap();
        assert!(outcome.degraded);
        assert!(outcome.context.is_some());

        let strict = engine_with(
            UnavailableReranker::new("model not found"),
            RetrievalConfig::default(),
        )
        .await;
        let err = strict.retrieve("Điều 8 quy định gì").await.unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_store_unavailable_is_retried() {
        let mut store = FlakyStore::new().await;
        store.lexical_failures = 2;
        let engine = flaky_engine(store);

        let outcome = engine.retrieve("mũ bảo hiểm").await.unwrap();
        assert!(!outcome.passages.is_empty());
        assert_eq!(engine.store.lexical_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_unavailable_after_retries() {
        let mut store = FlakyStore::new().await;
        store.lexical_failures = 10;
        let engine = flaky_engine(store);

        let err = engine.retrieve("mũ bảo hiểm").await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_UNAVAILABLE");
        assert_eq!(engine.store.lexical_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let mut store = FlakyStore::new().await;
        store.lexical_failures = 1;
        store.lexical_error = || QaError::database("malformed query");
        let engine = flaky_engine(store);

        let err = engine.retrieve("mũ bảo hiểm").await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert_eq!(engine.store.lexical_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_timeout_is_store_unavailable() {
        let mut store = FlakyStore::new().await;
        store.dense_hangs = true;
        let engine = flaky_engine(store);

        let err = engine.retrieve("mũ bảo hiểm").await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_missing_passages_are_skipped() {
        let mut store = FlakyStore::new().await;
        store.ghost_hit = true;
        let engine = flaky_engine(store);

        let outcome = engine.retrieve("mũ bảo hiểm").await.unwrap();
        assert!(!outcome.passages.is_empty());
        assert!(outcome.passages.iter().all(|p| p.passage.id != "ghost"));
    }

    async fn sqlite_engine(
        config: RetrievalConfig,
    ) -> RetrievalEngine<SqliteStore, MockEmbedder, KeywordOverlapReranker> {
        let embedder = MockEmbedder::new(256);
        let store = SqliteStore::open_memory().unwrap();
        store
            .insert_passages(&embedded_corpus(&embedder).await)
            .await
            .unwrap();
        RetrievalEngine::new(
            Arc::new(store),
            Arc::new(embedder),
            Arc::new(KeywordOverlapReranker::new()),
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_explicit_citation_over_sqlite() {
        let engine = sqlite_engine(RetrievalConfig::default()).await;
        let outcome = engine
            .retrieve("Điều 5 quy định gì về tốc độ tối đa?")
            .await
            .unwrap();

        assert_eq!(outcome.pattern, QueryPattern::ExplicitCitation);
        let top3: Vec<&str> = outcome
            .passages
            .iter()
            .take(3)
            .map(|p| p.passage.article_no.as_str())
            .collect();
        assert_eq!(top3, vec!["5", "5", "5"]);
        assert!(outcome.context.unwrap().citations[0].contains("Điều 5"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_search_timeout_under_contention() {
        let engine = sqlite_engine(RetrievalConfig {
            search_timeout_ms: 50,
            max_retries: 1,
            ..Default::default()
        })
        .await;
        let store = Arc::clone(&engine.store);

        let bulk: Vec<Passage> = (0..30_000)
            .map(|i| {
                passage(
                    &format!("bulk{}", i),
                    "99",
                    "Điều khoản chuyển tiếp",
                    "1",
                    "Phương tiện đã đăng ký trước ngày luật có hiệu lực tiếp tục được lưu hành.",
                )
            })
            .collect();
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.insert_passages(&bulk).await })
        };

        // Wait until the bulk insert holds the connection.
        let mut busy = false;
        for _ in 0..500 {
            if tokio::time::timeout(Duration::from_millis(5), store.stats())
                .await
                .is_err()
            {
                busy = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(busy);

        let started = std::time::Instant::now();
        let err = engine.retrieve("mũ bảo hiểm").await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_UNAVAILABLE");
        assert!(started.elapsed() < Duration::from_secs(1));

        writer.await.unwrap().unwrap();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = RetrievalEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockEmbedder::new(8)),
            Arc::new(KeywordOverlapReranker::new()),
            RetrievalConfig {
                final_k: 30,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
