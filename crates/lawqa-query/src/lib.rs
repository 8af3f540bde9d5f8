//! lawqa-query - Hybrid retrieval and reranking engine
//!
//! This crate turns a question about Vietnamese road-traffic law into a
//! small, citation-annotated context:
//!
//! - rule-based query classification (explicit citation, numeric threshold,
//!   semantic)
//! - concurrent lexical and dense search with timeouts and bounded retries
//! - normalized linear fusion with a pattern-dependent weight α
//! - batched cross-encoder reranking with an optional degraded mode
//! - context assembly and grounded answer generation
//!
//! # Example
//!
//! ```rust,ignore
//! use lawqa_query::RetrievalEngine;
//! use std::sync::Arc;
//!
//! let engine = RetrievalEngine::new(
//!     Arc::new(store),
//!     Arc::new(embedder),
//!     Arc::new(reranker),
//!     config.retrieval,
//! )?;
//! let outcome = engine.retrieve("Điều 5 quy định gì về tốc độ tối đa?").await?;
//! ```

mod answer;
mod classifier;
mod context;
mod engine;
mod fusion;
mod rerank;

pub use answer::{dedupe_citations, GroundedAnswerer, TRUNCATION_MARKER};
pub use classifier::QueryClassifier;
pub use context::{assemble_context, format_block, BLOCK_SEPARATOR};
pub use engine::RetrievalEngine;
pub use fusion::{fuse_scores, normalize, FusionOutcome, HybridFusion};
pub use rerank::{RerankOutcome, RerankStage};

// Re-export for convenience
pub use lawqa_core::{Answer, AssembledContext, RankedPassage, RetrievalOutcome};
