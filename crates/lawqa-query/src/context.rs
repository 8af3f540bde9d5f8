//! Citation-annotated context assembly.

use lawqa_core::{AssembledContext, RankedPassage};

/// Separator between passage blocks.
pub const BLOCK_SEPARATOR: &str = "\n\n";

/// Format one passage block: `[Căn cứ: <citation>]` then the enriched text.
pub fn format_block(citation: &str, enriched_text: &str) -> String {
    format!("[Căn cứ: {}]\n{}", citation, enriched_text)
}

/// Join final passages, in rank order, into the context handed to
/// generation.
///
/// Returns `None` when there are no passages, so callers can tell "nothing
/// retrieved" apart from an empty context string.
pub fn assemble_context(passages: &[RankedPassage]) -> Option<AssembledContext> {
    if passages.is_empty() {
        return None;
    }

    let blocks: Vec<String> = passages
        .iter()
        .map(|p| format_block(&p.passage.citation, &p.passage.enriched_text))
        .collect();
    let citations = passages
        .iter()
        .map(|p| p.passage.citation.clone())
        .collect();

    Some(AssembledContext {
        context: blocks.join(BLOCK_SEPARATOR),
        citations,
    })
}
