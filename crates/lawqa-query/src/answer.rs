//! Grounded answer generation over an assembled context.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use lawqa_core::text::{normalize_key, truncate_chars};
use lawqa_core::{Answer, AnswerConfig, AssembledContext, Generator, QaError, Result};

/// Appended to a context that was cut to the size limit.
pub const TRUNCATION_MARKER: &str = "\n… [context truncated]";

/// De-duplicate citations ignoring case and whitespace, keeping the first
/// spelling of each.
pub fn dedupe_citations(citations: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    citations
        .iter()
        .filter(|c| {
            let key = normalize_key(c);
            !key.is_empty() && seen.insert(key)
        })
        .cloned()
        .collect()
}

/// Calls a [`Generator`] only when retrieval produced enough context.
///
/// Short or missing contexts yield [`Answer::NoContext`] without a model
/// call, so the model never answers over nothing.
pub struct GroundedAnswerer<G> {
    generator: Arc<G>,
    config: AnswerConfig,
}

impl<G> GroundedAnswerer<G>
where
    G: Generator,
{
    pub fn new(generator: Arc<G>, config: AnswerConfig) -> Self {
        Self { generator, config }
    }

    pub async fn answer(
        &self,
        question: &str,
        context: Option<&AssembledContext>,
    ) -> Result<Answer> {
        let Some(context) = context else {
            debug!("No context retrieved, skipping generation");
            return Ok(Answer::NoContext);
        };

        let length = context.context.chars().count();
        if context.context.trim().is_empty() || length < self.config.min_context_chars {
            debug!(
                "Context too short for generation ({} < {} chars)",
                length, self.config.min_context_chars
            );
            return Ok(Answer::NoContext);
        }

        let text = if length > self.config.max_context_chars {
            format!(
                "{}{}",
                truncate_chars(&context.context, self.config.max_context_chars),
                TRUNCATION_MARKER
            )
        } else {
            context.context.clone()
        };
        let grounded = AssembledContext {
            context: text,
            citations: dedupe_citations(&context.citations),
        };

        let answer = self
            .generator
            .generate(question.trim(), &grounded)
            .await
            .map_err(|e| match e {
                QaError::GenerationUnavailable { .. } => e,
                other => QaError::generation_unavailable(other.to_string()),
            })?;

        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(Answer::NoContext);
        }

        info!(
            "Generated answer: {} chars, {} citations",
            answer.chars().count(),
            grounded.citations.len()
        );
        Ok(Answer::Grounded {
            text: answer.to_string(),
            citations: grounded.citations,
        })
    }
}
