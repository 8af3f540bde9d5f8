//! In-memory passage store with Okapi BM25 lexical ranking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use lawqa_core::text::tokenize;
use lawqa_core::{
    LexicalField, Passage, PassageStore, QaError, Result, ScoreOrigin, ScoredCandidate, Stats,
};

use crate::vector::{cosine_similarity, top_k};

/// BM25 term-frequency saturation.
const K1: f32 = 1.5;

/// BM25 length normalization.
const B: f32 = 0.75;

/// Floor for negative IDF values, as a fraction of the mean IDF.
const EPSILON: f32 = 0.25;

struct IndexedPassage {
    passage: Passage,
    /// Tokens per lexical field, in `LexicalField::ALL` order.
    field_tokens: Vec<Vec<String>>,
}

impl IndexedPassage {
    fn new(passage: Passage) -> Self {
        let field_tokens = LexicalField::ALL
            .iter()
            .map(|f| tokenize(passage.field(*f)))
            .collect();
        Self {
            passage,
            field_tokens,
        }
    }

    fn tokens_for(&self, fields: &[LexicalField]) -> Vec<&str> {
        LexicalField::ALL
            .iter()
            .zip(self.field_tokens.iter())
            .filter(|(f, _)| fields.contains(*f))
            .flat_map(|(_, tokens)| tokens.iter().map(String::as_str))
            .collect()
    }
}

/// Passage store held entirely in memory.
///
/// Lexical search is Okapi BM25 (k1 = 1.5, b = 0.75) computed over the
/// requested fields at query time; negative IDF values are floored to
/// `0.25 × mean IDF`. Dense search is an exact cosine scan.
#[derive(Default)]
pub struct MemoryStore {
    passages: RwLock<BTreeMap<String, IndexedPassage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with passages.
    pub fn with_passages(passages: Vec<Passage>) -> Result<Self> {
        let store = Self::new();
        store.insert_all(passages)?;
        Ok(store)
    }

    fn insert_all(&self, passages: Vec<Passage>) -> Result<()> {
        for passage in &passages {
            passage.validate()?;
        }
        let mut guard = self
            .passages
            .write()
            .map_err(|e| QaError::internal(e.to_string()))?;
        for passage in passages {
            guard.insert(passage.id.clone(), IndexedPassage::new(passage));
        }
        Ok(())
    }

    fn read(
        &self,
        operation: &str,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, IndexedPassage>>> {
        self.passages
            .read()
            .map_err(|e| QaError::store_unavailable(operation, e.to_string()))
    }
}

/// Okapi BM25 over a corpus of token lists.
fn bm25_scores(corpus: &[Vec<&str>], query: &[String]) -> Vec<f32> {
    let n = corpus.len();
    if n == 0 {
        return Vec::new();
    }

    let total_len: usize = corpus.iter().map(|d| d.len()).sum();
    let avgdl = (total_len as f32 / n as f32).max(f32::EPSILON);

    let mut doc_freq: BTreeMap<&str, usize> = BTreeMap::new();
    let mut term_freqs: Vec<HashMap<&str, usize>> = Vec::with_capacity(n);
    for doc in corpus {
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for token in doc {
            *tf.entry(*token).or_default() += 1;
        }
        for term in tf.keys() {
            *doc_freq.entry(*term).or_default() += 1;
        }
        term_freqs.push(tf);
    }

    let idf_of = |df: usize| ((n as f32 - df as f32 + 0.5) / (df as f32 + 0.5)).ln();
    let mean_idf = if doc_freq.is_empty() {
        0.0
    } else {
        doc_freq.values().map(|df| idf_of(*df)).sum::<f32>() / doc_freq.len() as f32
    };
    let floor = EPSILON * mean_idf;

    let mut scores = vec![0.0f32; n];
    for term in query {
        let Some(&df) = doc_freq.get(term.as_str()) else {
            continue;
        };
        let mut idf = idf_of(df);
        if idf < 0.0 {
            idf = floor;
        }
        for (i, tf) in term_freqs.iter().enumerate() {
            let Some(&freq) = tf.get(term.as_str()) else {
                continue;
            };
            let freq = freq as f32;
            let dl = corpus[i].len() as f32;
            scores[i] += idf * (freq * (K1 + 1.0)) / (freq + K1 * (1.0 - B + B * dl / avgdl));
        }
    }
    scores
}

#[async_trait]
impl PassageStore for MemoryStore {
    async fn insert_passages(&self, passages: &[Passage]) -> Result<()> {
        self.insert_all(passages.to_vec())?;
        debug!("Inserted {} passages", passages.len());
        Ok(())
    }

    async fn get_passage(&self, id: &str) -> Result<Option<Passage>> {
        let guard = self.read("passage lookup")?;
        Ok(guard.get(id).map(|p| p.passage.clone()))
    }

    async fn get_passages(&self, ids: &[String]) -> Result<Vec<Passage>> {
        let guard = self.read("passage lookup")?;
        Ok(ids
            .iter()
            .filter_map(|id| guard.get(id).map(|p| p.passage.clone()))
            .collect())
    }

    async fn search_lexical(
        &self,
        tokens: &[String],
        fields: &[LexicalField],
        k: usize,
    ) -> Result<Vec<ScoredCandidate>> {
        if tokens.is_empty() || fields.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let guard = self.read("lexical search")?;
        let docs: Vec<&IndexedPassage> = guard.values().collect();
        let corpus: Vec<Vec<&str>> = docs.iter().map(|d| d.tokens_for(fields)).collect();
        let scores = bm25_scores(&corpus, tokens);

        let query_terms: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        let matched: Vec<(String, f32)> = docs
            .iter()
            .zip(corpus.iter())
            .zip(scores)
            .filter(|((_, doc_tokens), _)| doc_tokens.iter().any(|t| query_terms.contains(t)))
            .map(|((doc, _), score)| (doc.passage.id.clone(), score))
            .collect();

        debug!("Lexical search matched {} passages", matched.len());
        Ok(top_k(matched, k, ScoreOrigin::Lexical))
    }

    async fn search_dense(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredCandidate>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let guard = self.read("dense search")?;
        let mut scored = Vec::with_capacity(guard.len());
        for doc in guard.values() {
            let stored = &doc.passage.embedding;
            if stored.is_empty() {
                continue;
            }
            if stored.len() != embedding.len() {
                return Err(QaError::invalid_argument(format!(
                    "query embedding has dimension {}, passage {} has {}",
                    embedding.len(),
                    doc.passage.id,
                    stored.len()
                )));
            }
            scored.push((doc.passage.id.clone(), cosine_similarity(embedding, stored)));
        }

        Ok(top_k(scored, k, ScoreOrigin::Dense))
    }

    async fn stats(&self) -> Result<Stats> {
        let guard = self.read("stats")?;
        let laws: HashSet<&str> = guard.values().map(|d| d.passage.law.as_str()).collect();
        Ok(Stats {
            passages: guard.len() as u64,
            embeddings: guard
                .values()
                .filter(|d| !d.passage.embedding.is_empty())
                .count() as u64,
            laws: laws.len() as u64,
            storage_bytes: 0,
        })
    }
}
