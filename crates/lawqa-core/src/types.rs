//! Core domain types for legal passage retrieval.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{QaError, Result};

/// Passage fields that lexical search can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LexicalField {
    ArticleNo,
    ArticleTitle,
    ClauseNo,
    Point,
    ClauseHead,
    Text,
}

impl LexicalField {
    /// Every searchable field, in index column order.
    pub const ALL: [LexicalField; 6] = [
        Self::ArticleNo,
        Self::ArticleTitle,
        Self::ClauseNo,
        Self::Point,
        Self::ClauseHead,
        Self::Text,
    ];

    /// Column name used by the store schemas.
    pub fn column(&self) -> &'static str {
        match self {
            Self::ArticleNo => "article_no",
            Self::ArticleTitle => "article_title",
            Self::ClauseNo => "clause_no",
            Self::Point => "point",
            Self::ClauseHead => "clause_head",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LexicalField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// A leaf of the legal hierarchy (Điều → Khoản → Điểm), the unit of retrieval.
///
/// Passages are produced upstream, stored once and treated as immutable by
/// the retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Unique identifier, e.g. `luatso-36-2024-QH15_D5_K1_a`.
    pub id: String,

    /// Name of the legal document, e.g. "Luật số 36/2024/QH15".
    #[serde(default, deserialize_with = "null_as_empty")]
    pub law: String,

    /// Chapter heading ("Chương II. ...").
    #[serde(default, deserialize_with = "null_as_empty")]
    pub chapter: String,

    /// Section heading ("Mục 1. ..."), often empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub section: String,

    /// Article number (Điều).
    #[serde(default, deserialize_with = "string_or_number")]
    pub article_no: String,

    /// Article title.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub article_title: String,

    /// Clause number (Khoản), absent for article preambles.
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub clause_no: Option<String>,

    /// Point label (Điểm), e.g. "a" or "đ".
    #[serde(default)]
    pub point: Option<String>,

    /// Leading sentence of the clause, before its points.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub clause_head: String,

    /// Raw passage text.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,

    /// Raw text wrapped with structural tags for embedding and reranking.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub enriched_text: String,

    /// Human-readable citation, e.g. "điểm a khoản 1 Điều 5 Luật số 36/2024/QH15".
    #[serde(default, alias = "display_citation", deserialize_with = "null_as_empty")]
    pub citation: String,

    /// Dense embedding of `enriched_text`. Empty until indexed.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl Passage {
    /// Check the data-model invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(QaError::invalid_passage("<empty>", "missing id"));
        }
        if self.text.trim().is_empty() {
            return Err(QaError::invalid_passage(&self.id, "empty text"));
        }
        if self.citation.trim().is_empty() {
            return Err(QaError::invalid_passage(&self.id, "empty citation"));
        }
        if self.enriched_text.chars().count() < self.text.chars().count() {
            return Err(QaError::invalid_passage(
                &self.id,
                "enriched text is shorter than raw text",
            ));
        }
        Ok(())
    }

    /// Value of a lexical field.
    pub fn field(&self, field: LexicalField) -> &str {
        match field {
            LexicalField::ArticleNo => &self.article_no,
            LexicalField::ArticleTitle => &self.article_title,
            LexicalField::ClauseNo => self.clause_no.as_deref().unwrap_or(""),
            LexicalField::Point => self.point.as_deref().unwrap_or(""),
            LexicalField::ClauseHead => &self.clause_head,
            LexicalField::Text => &self.text,
        }
    }

    /// Return a copy carrying the given embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Builds a [`Passage`] from its locator fields, composing the enriched text
/// and citation the way the indexer does.
#[derive(Debug, Clone, Default)]
pub struct PassageBuilder {
    id: String,
    law: String,
    chapter: String,
    section: String,
    article_no: String,
    article_title: String,
    clause_no: Option<String>,
    clause_head: String,
    point: Option<String>,
    text: String,
}

impl PassageBuilder {
    /// Start a passage for an article of a law.
    pub fn new(id: impl Into<String>, law: impl Into<String>, article_no: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            law: law.into(),
            article_no: article_no.into(),
            ..Default::default()
        }
    }

    pub fn chapter(mut self, chapter: impl Into<String>) -> Self {
        self.chapter = chapter.into();
        self
    }

    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    pub fn article_title(mut self, title: impl Into<String>) -> Self {
        self.article_title = title.into();
        self
    }

    /// Set the clause number and its leading sentence.
    pub fn clause(mut self, clause_no: impl Into<String>, head: impl Into<String>) -> Self {
        self.clause_no = Some(clause_no.into());
        self.clause_head = head.into();
        self
    }

    pub fn point(mut self, label: impl Into<String>) -> Self {
        self.point = Some(label.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Compose enriched text and citation, then validate.
    pub fn build(self) -> Result<Passage> {
        let text = self.text.trim().to_string();
        let enriched_text = self.enriched_text(&text);
        let citation = self.citation();

        let passage = Passage {
            id: self.id,
            law: self.law,
            chapter: self.chapter,
            section: self.section,
            article_no: self.article_no,
            article_title: self.article_title,
            clause_no: self.clause_no,
            point: self.point,
            clause_head: self.clause_head,
            text,
            enriched_text,
            citation,
            embedding: Vec::new(),
        };
        passage.validate()?;
        Ok(passage)
    }

    fn enriched_text(&self, text: &str) -> String {
        let mut lines = Vec::new();
        if !self.chapter.is_empty() {
            lines.push(format!("[CHAPTER] {}", self.chapter));
        }
        if !self.article_no.is_empty() {
            if self.article_title.is_empty() {
                lines.push(format!("[ARTICLE] Điều {}", self.article_no));
            } else {
                lines.push(format!("[ARTICLE] Điều {}. {}", self.article_no, self.article_title));
            }
        }
        if let Some(clause_no) = &self.clause_no {
            if self.clause_head.is_empty() {
                lines.push(format!("[CLAUSE] Khoản {}", clause_no));
            } else {
                lines.push(format!("[CLAUSE] Khoản {}. {}", clause_no, self.clause_head));
            }
        }
        match &self.point {
            // The point line carries the leaf text itself.
            Some(label) => lines.push(format!("[POINT] Điểm {}) {}", label, text)),
            None => lines.push(text.to_string()),
        }
        lines.join("\n").trim().to_string()
    }

    fn citation(&self) -> String {
        let mut parts = Vec::new();
        if let Some(point) = &self.point {
            parts.push(format!("điểm {}", point));
        }
        if let Some(clause_no) = &self.clause_no {
            parts.push(format!("khoản {}", clause_no));
        }
        parts.push(format!("Điều {}", self.article_no));
        if !self.law.is_empty() {
            parts.push(self.law.clone());
        }
        parts.join(" ")
    }
}

/// Which stage produced a score. Scores of different origins are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreOrigin {
    Lexical,
    Dense,
    Fused,
    Reranked,
}

impl std::fmt::Display for ScoreOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Lexical => "lexical",
            Self::Dense => "dense",
            Self::Fused => "fused",
            Self::Reranked => "reranked",
        };
        write!(f, "{}", s)
    }
}

/// A passage id with a score from one ranking stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub passage_id: String,
    pub score: f32,
    pub origin: ScoreOrigin,
}

impl ScoredCandidate {
    pub fn new(passage_id: impl Into<String>, score: f32, origin: ScoreOrigin) -> Self {
        Self {
            passage_id: passage_id.into(),
            score,
            origin,
        }
    }

    pub fn lexical(passage_id: impl Into<String>, score: f32) -> Self {
        Self::new(passage_id, score, ScoreOrigin::Lexical)
    }

    pub fn dense(passage_id: impl Into<String>, score: f32) -> Self {
        Self::new(passage_id, score, ScoreOrigin::Dense)
    }
}

/// Query category driving the fusion weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPattern {
    /// The question names an article, clause or point ("Điều 5", "Khoản 2").
    ExplicitCitation,
    /// The question carries a quantity with a unit ("10km/h", "2 triệu").
    NumericThreshold,
    /// Anything else.
    Semantic,
}

impl std::fmt::Display for QueryPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExplicitCitation => "explicit-citation",
            Self::NumericThreshold => "numeric-threshold",
            Self::Semantic => "semantic",
        };
        write!(f, "{}", s)
    }
}

/// A passage in the final result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPassage {
    /// Result rank (1-indexed).
    pub rank: u32,

    /// The retrieved passage.
    pub passage: Passage,

    /// Score after hybrid fusion.
    pub fused_score: f32,

    /// Cross-encoder score, absent when reranking was skipped in degraded mode.
    pub rerank_score: Option<f32>,
}

/// Citation-annotated context handed to generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    /// Passage blocks joined by blank lines.
    pub context: String,

    /// One citation per block, in the same order.
    pub citations: Vec<String>,
}

/// Result of one retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    /// The question as asked.
    pub question: String,

    /// Detected query pattern.
    pub pattern: QueryPattern,

    /// Fusion weight actually applied.
    pub alpha: f32,

    /// Final passages in rank order.
    pub passages: Vec<RankedPassage>,

    /// Assembled context; `None` when nothing relevant was found.
    pub context: Option<AssembledContext>,

    /// True when the reranker was bypassed in degraded mode.
    pub degraded: bool,

    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
}

impl RetrievalOutcome {
    /// Whether retrieval produced no usable context.
    pub fn is_empty(&self) -> bool {
        self.context.is_none()
    }
}

/// Outcome of grounded answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    /// An answer generated from retrieved law passages.
    Grounded { text: String, citations: Vec<String> },

    /// Retrieval found no usable context; no answer was generated.
    NoContext,
}

/// Statistics about the passage store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    /// Number of passages.
    pub passages: u64,

    /// Number of passages carrying an embedding.
    pub embeddings: u64,

    /// Number of distinct laws.
    pub laws: u64,

    /// Storage size in bytes (0 for in-memory stores).
    pub storage_bytes: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Int(i64),
    Float(f64),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<StringOrNumber> = Option::deserialize(deserializer)?;
    Ok(value.map(StringOrNumber::into_string))
}
