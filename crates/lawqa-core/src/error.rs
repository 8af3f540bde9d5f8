//! Error types for the retrieval pipeline.

use thiserror::Error;

/// Result type alias using QaError.
pub type Result<T> = std::result::Result<T, QaError>;

/// Errors that can occur while indexing or answering a question.
///
/// An empty retrieval is not an error: it is reported as a `RetrievalOutcome`
/// without context. Query classification is total and never fails.
#[derive(Error, Debug)]
pub enum QaError {
    /// The passage store could not be reached or timed out.
    #[error("Passage store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    /// The reranking model could not be reached, timed out or misbehaved.
    #[error("Reranker unavailable: {reason}")]
    RerankUnavailable { reason: String },

    /// The embedding model could not produce a query vector.
    #[error("Embedding model unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// The generation model failed.
    #[error("Generation model unavailable: {reason}")]
    GenerationUnavailable { reason: String },

    /// A passage record violates the data model.
    #[error("Invalid passage {id}: {reason}")]
    InvalidPassage { id: String, reason: String },

    /// Passage not found.
    #[error("Passage not found: {id}")]
    PassageNotFound { id: String },

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Model loading or inference setup error.
    #[error("Embedding error: {message}")]
    Embedding { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QaError {
    /// Create a store-unavailable error for the named operation.
    pub fn store_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a reranker-unavailable error.
    pub fn rerank_unavailable(reason: impl Into<String>) -> Self {
        Self::RerankUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an embedding-unavailable error.
    pub fn embedding_unavailable(reason: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a generation-unavailable error.
    pub fn generation_unavailable(reason: impl Into<String>) -> Self {
        Self::GenerationUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an invalid passage error.
    pub fn invalid_passage(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPassage {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error reports an unreachable external collaborator.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::RerankUnavailable { .. }
                | Self::EmbeddingUnavailable { .. }
                | Self::GenerationUnavailable { .. }
        )
    }

    /// Get a stable error code for callers and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::RerankUnavailable { .. } => "RERANK_UNAVAILABLE",
            Self::EmbeddingUnavailable { .. } => "EMBEDDING_UNAVAILABLE",
            Self::GenerationUnavailable { .. } => "GENERATION_UNAVAILABLE",
            Self::InvalidPassage { .. } => "INVALID_PASSAGE",
            Self::PassageNotFound { .. } => "PASSAGE_NOT_FOUND",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
