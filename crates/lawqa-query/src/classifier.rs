//! Rule-based query classification.

use std::sync::LazyLock;

use regex::Regex;

use lawqa_core::QueryPattern;

/// "Điều 5", "Điều 8a", "Khoản 2", "Chương IV", "Mục 1", "điểm a".
static LEGAL_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:chương|mục|điều|khoản)\s+(?:\d+[a-zđ]?|[IVXLC]+)\b|\b(?i:điểm)\s+[a-zđ]\b")
        .expect("legal reference regex is valid")
});

/// A number followed by a speed, money, time, quantity or licence unit.
static NUMERIC_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d+\s*(?:km/h|km/giờ|giờ|triệu|nghìn|ngàn|đồng|vnd|lần|ngày|tháng|năm|%|phần trăm|cm3|cc|tấn|km|m|kw|điểm|giấy phép lái xe|đ)(?:[^\p{L}\p{N}]|$)",
    )
    .expect("numeric unit regex is valid")
});

/// Assigns each question exactly one [`QueryPattern`].
///
/// Rules are checked in order and the first match wins:
/// 1. an explicit article/clause/point reference → `ExplicitCitation`
/// 2. a number next to a recognized unit → `NumericThreshold`
/// 3. anything else → `Semantic`
///
/// Classification is total and depends only on the question text.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryClassifier;

impl QueryClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, question: &str) -> QueryPattern {
        if LEGAL_REFERENCE_RE.is_match(question) {
            QueryPattern::ExplicitCitation
        } else if NUMERIC_UNIT_RE.is_match(question) {
            QueryPattern::NumericThreshold
        } else {
            QueryPattern::Semantic
        }
    }
}
