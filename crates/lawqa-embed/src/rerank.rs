//! Cross-encoder rerankers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use lawqa_core::text::tokenize;
use lawqa_core::{QaError, Reranker, RerankerConfig, Result};

use crate::onnx::{load_session, load_tokenizer};

struct RerankerInner {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_length: usize,
    token_type_ids: bool,
}

/// Cross-encoder reranker backed by an ONNX export (bge-reranker-v2-m3 by
/// default). Each (question, passage) pair is encoded jointly and the
/// first logit is its relevance score.
#[derive(Clone)]
pub struct OnnxReranker {
    inner: Arc<RerankerInner>,
    batch_size: usize,
}

impl OnnxReranker {
    /// Load the cross-encoder. Any load failure is `RerankUnavailable`.
    pub fn from_config(config: &RerankerConfig) -> Result<Self> {
        let model = config.model_path.join("model.onnx");
        if !model.is_file() {
            return Err(QaError::rerank_unavailable(format!(
                "Reranker model not found at {:?}",
                model
            )));
        }

        let unavailable = |e: QaError| QaError::rerank_unavailable(e.to_string());
        let session = load_session(&model, config.num_threads).map_err(unavailable)?;
        let mut tokenizer = load_tokenizer(&config.model_path).map_err(unavailable)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_length,
                ..Default::default()
            }))
            .map_err(|e| {
                QaError::rerank_unavailable(format!("Failed to configure truncation: {}", e))
            })?;

        info!(
            "Reranker initialized: max_length={}, batch_size={}",
            config.max_length, config.batch_size
        );

        Ok(Self {
            inner: Arc::new(RerankerInner {
                session: Mutex::new(session),
                tokenizer,
                max_length: config.max_length,
                token_type_ids: config.token_type_ids,
            }),
            batch_size: config.batch_size.max(1),
        })
    }
}

impl RerankerInner {
    fn score_batch(&self, question: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Vec<(&str, &str)> = passages.iter().map(|p| (question, p.as_str())).collect();
        let encodings = self
            .tokenizer
            .encode_batch(pairs, true)
            .map_err(|e| QaError::rerank_unavailable(format!("Tokenization failed: {}", e)))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(self.max_length))
            .max()
            .unwrap_or(0)
            .max(1);
        let batch_size = encodings.len();

        debug!("Reranking batch: size={}, max_len={}", batch_size, max_len);

        let mut ids = vec![0i64; batch_size * max_len];
        let mut mask = vec![0i64; batch_size * max_len];
        let mut types = vec![0i64; batch_size * max_len];
        for (i, enc) in encodings.iter().enumerate() {
            let len = enc.get_ids().len().min(max_len);
            for j in 0..len {
                ids[i * max_len + j] = enc.get_ids()[j] as i64;
                mask[i * max_len + j] = enc.get_attention_mask()[j] as i64;
                types[i * max_len + j] = enc.get_type_ids()[j] as i64;
            }
        }

        let shape = vec![batch_size, max_len];
        let tensor_err =
            |e: ort::Error| QaError::rerank_unavailable(format!("Failed to create tensor: {}", e));
        let input_ids = Tensor::from_array((shape.clone(), ids)).map_err(tensor_err)?;
        let attention_mask = Tensor::from_array((shape.clone(), mask)).map_err(tensor_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| QaError::rerank_unavailable(format!("Failed to lock session: {}", e)))?;

        let outputs = if self.token_type_ids {
            let token_type_ids = Tensor::from_array((shape, types)).map_err(tensor_err)?;
            session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])
        }
        .map_err(|e| QaError::rerank_unavailable(format!("Reranker inference failed: {}", e)))?;

        // logits: [batch, 1] or [batch]
        let (_, logits) = outputs
            .iter()
            .next()
            .ok_or_else(|| QaError::rerank_unavailable("No output tensor found"))?;
        let (_, data) = logits
            .try_extract_tensor::<f32>()
            .map_err(|e| QaError::rerank_unavailable(format!("Failed to extract logits: {}", e)))?;

        if data.len() != batch_size {
            return Err(QaError::rerank_unavailable(format!(
                "Cross-encoder returned {} scores for {} pairs",
                data.len(),
                batch_size
            )));
        }
        Ok(data.to_vec())
    }
}

#[async_trait]
impl Reranker for OnnxReranker {
    async fn score_pairs(&self, question: &str, passages: &[&str]) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let question = question.to_string();
        let passages: Vec<String> = passages.iter().map(|p| p.to_string()).collect();

        tokio::task::spawn_blocking(move || inner.score_batch(&question, &passages))
            .await
            .map_err(|e| QaError::rerank_unavailable(format!("Rerank task failed: {}", e)))?
    }

    fn max_batch(&self) -> usize {
        self.batch_size
    }
}

/// Stands in for a cross-encoder that could not be loaded: every call
/// reports `RerankUnavailable`, so the rerank stage fails or degrades the
/// same way it does when a loaded model stops responding.
#[derive(Debug, Clone)]
pub struct UnavailableReranker {
    reason: String,
}

impl UnavailableReranker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Reranker for UnavailableReranker {
    async fn score_pairs(&self, _question: &str, _passages: &[&str]) -> Result<Vec<f32>> {
        Err(QaError::rerank_unavailable(self.reason.clone()))
    }
}

/// Lightweight reranker scoring the fraction of question tokens that occur
/// in the passage. Needs no model files; used for tests and as a fallback
/// when no cross-encoder is installed.
#[derive(Debug, Clone)]
pub struct KeywordOverlapReranker {
    max_batch: usize,
}

impl KeywordOverlapReranker {
    pub fn new() -> Self {
        Self { max_batch: 16 }
    }

    pub fn with_max_batch(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
        }
    }

    fn score(question_tokens: &HashSet<String>, passage: &str) -> f32 {
        if question_tokens.is_empty() {
            return 0.0;
        }
        let passage_tokens: HashSet<String> = tokenize(passage).into_iter().collect();
        let hits = question_tokens
            .iter()
            .filter(|t| passage_tokens.contains(*t))
            .count();
        hits as f32 / question_tokens.len() as f32
    }
}

impl Default for KeywordOverlapReranker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reranker for KeywordOverlapReranker {
    async fn score_pairs(&self, question: &str, passages: &[&str]) -> Result<Vec<f32>> {
        let question_tokens: HashSet<String> = tokenize(question).into_iter().collect();
        Ok(passages
            .iter()
            .map(|p| Self::score(&question_tokens, p))
            .collect())
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }
}
