//! Configuration types for the retrieval pipeline.
//!
//! Components receive their section of the configuration at construction;
//! nothing here is process-global.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QaError, Result};
use crate::types::{LexicalField, QueryPattern};

/// Upper bound for `retrieval.max_retries`.
pub const MAX_RETRIES: u32 = 5;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding model configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reranking model configuration.
    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Retrieval, fusion and reranking parameters.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Grounded answering parameters.
    #[serde(default)]
    pub answer: AnswerConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: 30000,
        }
    }
}

/// How hidden states are pooled into a sentence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// First token (gte-multilingual-base).
    Cls,
    /// Attention-masked mean over tokens.
    Mean,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default = "default_embedding_model_path")]
    pub model_path: PathBuf,

    /// Embedding dimension.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum input tokens.
    #[serde(default = "default_embedding_max_tokens")]
    pub max_tokens: usize,

    /// Pooling strategy.
    #[serde(default = "default_pooling")]
    pub pooling: Pooling,

    /// Batch size for indexing.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of threads for CPU inference.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: default_embedding_model_path(),
            dimension: 768,
            max_tokens: 8192,
            pooling: Pooling::Cls,
            batch_size: 32,
            num_threads: 4,
        }
    }
}

/// Cross-encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default = "default_reranker_model_path")]
    pub model_path: PathBuf,

    /// Maximum tokens per (question, passage) pair.
    #[serde(default = "default_reranker_max_length")]
    pub max_length: usize,

    /// Pairs per inference call.
    #[serde(default = "default_reranker_batch")]
    pub batch_size: usize,

    /// Feed `token_type_ids` (BERT-style models; XLM-R models take none).
    #[serde(default)]
    pub token_type_ids: bool,

    /// Number of threads for CPU inference.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            model_path: default_reranker_model_path(),
            max_length: 512,
            batch_size: 16,
            token_type_ids: false,
            num_threads: 4,
        }
    }
}

/// Score normalization applied to each ranking before fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `(s - min) / (max - min)` within the ranking.
    #[default]
    MinMax,
    /// `1 - r / n` from the (tie-aware) rank within the ranking.
    Rank,
}

/// Fusion weight α per query pattern. α weights the dense side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlphaTable {
    #[serde(default = "default_alpha_explicit")]
    pub explicit_citation: f32,

    #[serde(default = "default_alpha_numeric")]
    pub numeric_threshold: f32,

    #[serde(default = "default_alpha_semantic")]
    pub semantic: f32,
}

impl Default for AlphaTable {
    fn default() -> Self {
        Self {
            explicit_citation: 0.30,
            numeric_threshold: 0.40,
            semantic: 0.75,
        }
    }
}

impl AlphaTable {
    /// α for a query pattern.
    pub fn alpha_for(&self, pattern: QueryPattern) -> f32 {
        match pattern {
            QueryPattern::ExplicitCitation => self.explicit_citation,
            QueryPattern::NumericThreshold => self.numeric_threshold,
            QueryPattern::Semantic => self.semantic,
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Fused candidates passed to the reranker.
    #[serde(default = "default_initial_k")]
    pub initial_k: usize,

    /// Passages kept after reranking.
    #[serde(default = "default_final_k")]
    pub final_k: usize,

    /// Results requested from each of lexical and dense search.
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    /// α used when no passage appears in both rankings.
    #[serde(default = "default_base_alpha")]
    pub base_alpha: f32,

    /// α per query pattern.
    #[serde(default)]
    pub alpha: AlphaTable,

    /// Per-ranking score normalization.
    #[serde(default)]
    pub normalization: Normalization,

    /// Fields searched lexically.
    #[serde(default = "default_lexical_fields")]
    pub lexical_fields: Vec<LexicalField>,

    /// Timeout for each store search and the query embedding, in milliseconds.
    #[serde(default = "default_search_timeout")]
    pub search_timeout_ms: u64,

    /// Timeout for each reranker batch, in milliseconds.
    #[serde(default = "default_rerank_timeout")]
    pub rerank_timeout_ms: u64,

    /// Retries after a failed store search.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fall back to fused order when the reranker is unavailable.
    #[serde(default)]
    pub degraded_rerank: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            initial_k: 20,
            final_k: 5,
            candidate_pool: 50,
            base_alpha: 0.55,
            alpha: AlphaTable::default(),
            normalization: Normalization::MinMax,
            lexical_fields: default_lexical_fields(),
            search_timeout_ms: 10_000,
            rerank_timeout_ms: 30_000,
            max_retries: 2,
            degraded_rerank: false,
        }
    }
}

impl RetrievalConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    /// Number of results requested from each search.
    pub fn fetch_k(&self) -> usize {
        self.candidate_pool.max(self.initial_k)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let alphas = [
            ("base_alpha", self.base_alpha),
            ("alpha.explicit_citation", self.alpha.explicit_citation),
            ("alpha.numeric_threshold", self.alpha.numeric_threshold),
            ("alpha.semantic", self.alpha.semantic),
        ];
        for (name, value) in alphas {
            if !(0.0..=1.0).contains(&value) {
                return Err(QaError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.final_k == 0 {
            return Err(QaError::config("final_k must be at least 1"));
        }
        if self.final_k > self.initial_k {
            return Err(QaError::config(format!(
                "final_k ({}) must not exceed initial_k ({})",
                self.final_k, self.initial_k
            )));
        }
        if self.lexical_fields.is_empty() {
            return Err(QaError::config("lexical_fields must not be empty"));
        }
        if self.search_timeout_ms == 0 || self.rerank_timeout_ms == 0 {
            return Err(QaError::config("timeouts must be non-zero"));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(QaError::config(format!(
                "max_retries must be at most {}, got {}",
                MAX_RETRIES, self.max_retries
            )));
        }
        Ok(())
    }
}

/// Grounded answering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    /// Context is cut to this many characters before generation.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Shorter contexts are treated as "no context".
    #[serde(default = "default_min_context_chars")]
    pub min_context_chars: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_context_chars: 20000,
            min_context_chars: 300,
        }
    }
}

// Default value functions

fn default_busy_timeout() -> u32 {
    30000
}

fn default_dimension() -> usize {
    768
}

fn default_embedding_max_tokens() -> usize {
    8192
}

fn default_pooling() -> Pooling {
    Pooling::Cls
}

fn default_batch_size() -> usize {
    32
}

fn default_num_threads() -> usize {
    4
}

fn default_reranker_max_length() -> usize {
    512
}

fn default_reranker_batch() -> usize {
    16
}

fn default_alpha_explicit() -> f32 {
    0.30
}

fn default_alpha_numeric() -> f32 {
    0.40
}

fn default_alpha_semantic() -> f32 {
    0.75
}

fn default_initial_k() -> usize {
    20
}

fn default_final_k() -> usize {
    5
}

fn default_candidate_pool() -> usize {
    50
}

fn default_base_alpha() -> f32 {
    0.55
}

fn default_lexical_fields() -> Vec<LexicalField> {
    LexicalField::ALL.to_vec()
}

fn default_search_timeout() -> u64 {
    10_000
}

fn default_rerank_timeout() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_context_chars() -> usize {
    20000
}

fn default_min_context_chars() -> usize {
    300
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lawqa")
}

fn default_database_path() -> PathBuf {
    data_dir().join("lawqa.db")
}

fn default_embedding_model_path() -> PathBuf {
    data_dir().join("models").join("gte-multilingual-base")
}

fn default_reranker_model_path() -> PathBuf {
    data_dir().join("models").join("bge-reranker-v2-m3")
}

impl QaConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| QaError::config(format!("Failed to parse config: {}", e)))?;
        config.retrieval.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("lawqa").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("lawqa.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        // Return defaults
        Ok(Self::default())
    }
}
