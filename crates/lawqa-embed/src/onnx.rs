//! ONNX-based embedding model implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayViewD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};
use tracing::{debug, info};

use lawqa_core::text::tokenize;
use lawqa_core::{Embedder, EmbeddingConfig, Pooling, QaError, Result};

/// Build an ONNX Runtime session for a model file.
pub(crate) fn load_session(model_path: &Path, num_threads: usize) -> Result<Session> {
    info!("Loading ONNX model from {:?}", model_path);

    Session::builder()
        .map_err(|e| QaError::embedding(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| QaError::embedding(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(num_threads.max(1))
        .map_err(|e| QaError::embedding(format!("Failed to set thread count: {}", e)))?
        .commit_from_file(model_path)
        .map_err(|e| QaError::embedding(format!("Failed to load model {:?}: {}", model_path, e)))
}

/// Load `tokenizer.json` from a model directory.
pub(crate) fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let path = model_dir.join("tokenizer.json");
    info!("Loading tokenizer from {:?}", path);
    Tokenizer::from_file(&path)
        .map_err(|e| QaError::embedding(format!("Failed to load tokenizer {:?}: {}", path, e)))
}

/// L2 normalize a vector in place. Zero vectors are left unchanged.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

struct EmbedderInner {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
    max_tokens: usize,
    pooling: Pooling,
    batch_size: usize,
}

/// Bi-encoder embedder backed by an ONNX export of a multilingual model
/// (gte-multilingual-base by default).
///
/// The model directory must contain `model.onnx` and `tokenizer.json`.
/// Questions and passages are embedded the same way, without prefixes.
/// Inference runs on the blocking thread pool.
#[derive(Clone)]
pub struct OnnxEmbedder {
    inner: Arc<EmbedderInner>,
}

impl OnnxEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let session = load_session(&config.model_path.join("model.onnx"), config.num_threads)?;
        let tokenizer = load_tokenizer(&config.model_path)?;

        info!(
            "Embedder initialized: dim={}, max_tokens={}, pooling={:?}",
            config.dimension, config.max_tokens, config.pooling
        );

        Ok(Self {
            inner: Arc::new(EmbedderInner {
                session: Mutex::new(session),
                tokenizer,
                dimension: config.dimension,
                max_tokens: config.max_tokens,
                pooling: config.pooling,
                batch_size: config.batch_size.max(1),
            }),
        })
    }

    async fn embed_owned(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(inner.batch_size) {
                out.extend(inner.embed_batch(chunk)?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| QaError::embedding_unavailable(format!("Embedding task failed: {}", e)))?
    }
}

impl EmbedderInner {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(refs, true)
            .map_err(|e| QaError::embedding_unavailable(format!("Tokenization failed: {}", e)))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .min(self.max_tokens)
            .max(1);
        let batch_size = encodings.len();

        debug!("Embedding batch: size={}, max_len={}", batch_size, max_len);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for j in 0..ids.len().min(max_len) {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
            }
        }

        let input_ids = Tensor::from_array((vec![batch_size, max_len], input_ids)).map_err(|e| {
            QaError::embedding_unavailable(format!("Failed to create input tensor: {}", e))
        })?;
        let attention_mask = Tensor::from_array((vec![batch_size, max_len], attention_mask))
            .map_err(|e| {
                QaError::embedding_unavailable(format!("Failed to create mask tensor: {}", e))
            })?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| QaError::embedding_unavailable(format!("Failed to lock session: {}", e)))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask
            ])
            .map_err(|e| QaError::embedding_unavailable(format!("Inference failed: {}", e)))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| QaError::embedding_unavailable("No output tensor found"))?;
        let view = output.try_extract_array::<f32>().map_err(|e| {
            QaError::embedding_unavailable(format!("Failed to extract tensor: {}", e))
        })?;

        let embeddings = match view.ndim() {
            // (batch, seq_len, hidden): pool over the sequence
            3 => self.pool(&view, &encodings, max_len),
            // (batch, hidden): already pooled
            2 => {
                let hidden = view.shape()[1];
                (0..batch_size)
                    .map(|i| {
                        let mut v: Vec<f32> = (0..hidden).map(|j| view[[i, j]]).collect();
                        l2_normalize(&mut v);
                        v
                    })
                    .collect()
            }
            _ => {
                return Err(QaError::embedding_unavailable(format!(
                    "Unexpected output shape: {:?}",
                    view.shape()
                )))
            }
        };

        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(QaError::embedding(format!(
                "Model produced dimension {}, configured {}",
                bad.len(),
                self.dimension
            )));
        }
        Ok(embeddings)
    }

    /// Pool token states into one L2-normalized vector per input.
    fn pool(
        &self,
        tensor: &ArrayViewD<'_, f32>,
        encodings: &[Encoding],
        max_len: usize,
    ) -> Vec<Vec<f32>> {
        let seq_len = tensor.shape()[1];
        let hidden = tensor.shape()[2];

        encodings
            .iter()
            .enumerate()
            .map(|(i, encoding)| {
                let mut v = match self.pooling {
                    Pooling::Cls => (0..hidden).map(|k| tensor[[i, 0, k]]).collect(),
                    Pooling::Mean => {
                        let mask = encoding.get_attention_mask();
                        let mut sum = vec![0.0f32; hidden];
                        let mut count = 0usize;
                        for j in 0..mask.len().min(max_len).min(seq_len) {
                            if mask[j] == 1 {
                                count += 1;
                                for (k, s) in sum.iter_mut().enumerate() {
                                    *s += tensor[[i, j, k]];
                                }
                            }
                        }
                        if count > 0 {
                            for s in &mut sum {
                                *s /= count as f32;
                            }
                        }
                        sum
                    }
                };
                l2_normalize(&mut v);
                v
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.embed_owned(texts.iter().map(|t| t.to_string()).collect())
            .await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_owned(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QaError::embedding_unavailable("No embedding returned"))
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }
}

/// A deterministic embedder for tests that doesn't require model files.
///
/// Tokens are feature-hashed (FNV-1a) into `dimension` buckets and the
/// counts are L2-normalized, so cosine similarity tracks shared vocabulary.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let hash = token.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
            v[(hash % self.dimension as u64) as usize] += 1.0;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(768)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
