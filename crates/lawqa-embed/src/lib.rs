//! lawqa-embed - ONNX embedding and cross-encoder models
//!
//! This crate provides the model-backed collaborators of the retrieval
//! pipeline:
//!
//! - [`OnnxEmbedder`]: multilingual bi-encoder with CLS or mean pooling
//!   and L2 normalization
//! - [`OnnxReranker`]: batched cross-encoder scoring of (question, passage)
//!   pairs
//! - [`MockEmbedder`] and [`KeywordOverlapReranker`]: deterministic
//!   stand-ins that need no model files
//! - [`UnavailableReranker`]: placeholder for a cross-encoder that failed
//!   to load

mod onnx;
mod rerank;

pub use onnx::{MockEmbedder, OnnxEmbedder};
pub use rerank::{KeywordOverlapReranker, OnnxReranker, UnavailableReranker};

// Re-export the model traits for convenience
pub use lawqa_core::{Embedder, Reranker};
