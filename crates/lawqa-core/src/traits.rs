//! Capability interfaces between the pipeline and its external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AssembledContext, LexicalField, Passage, ScoredCandidate, Stats};

/// Passage storage and search.
///
/// Search methods must report an unreachable store as
/// `QaError::StoreUnavailable`; an empty `Vec` always means "no matches".
#[async_trait]
pub trait PassageStore: Send + Sync {
    /// Insert or replace passages.
    async fn insert_passages(&self, passages: &[Passage]) -> Result<()>;

    /// Fetch a single passage.
    async fn get_passage(&self, id: &str) -> Result<Option<Passage>>;

    /// Fetch passages by id, in request order. Unknown ids are skipped.
    async fn get_passages(&self, ids: &[String]) -> Result<Vec<Passage>>;

    /// BM25-style keyword search over the given fields.
    ///
    /// Returns at most `k` candidates with origin `Lexical`, best first,
    /// ties broken by passage id.
    async fn search_lexical(
        &self,
        tokens: &[String],
        fields: &[LexicalField],
        k: usize,
    ) -> Result<Vec<ScoredCandidate>>;

    /// Cosine-similarity search over passage embeddings.
    ///
    /// Returns at most `k` candidates with origin `Dense`, best first,
    /// ties broken by passage id.
    async fn search_dense(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredCandidate>>;

    // Stats
    async fn stats(&self) -> Result<Stats>;
}

/// Embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of passage texts.
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single question. Deterministic for a given model.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;
}

/// Pairwise (question, passage) relevance model.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each passage text against the question.
    ///
    /// Returns exactly one score per input text, in input order.
    async fn score_pairs(&self, question: &str, passages: &[&str]) -> Result<Vec<f32>>;

    /// Maximum number of pairs per `score_pairs` call.
    fn max_batch(&self) -> usize {
        16
    }
}

/// Answer-generation model.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce an answer to the question grounded in the context.
    async fn generate(&self, question: &str, context: &AssembledContext) -> Result<String>;
}
