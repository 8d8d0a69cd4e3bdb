//! Context window assembly: ranked chunks and prior turns rendered into a
//! prompt that fits the token budget.

use ragway_core::domain::chunk::{rank_chunks, RetrievedChunk};
use ragway_core::domain::collection::{CollectionVersion, DEFAULT_PROMPT_TEMPLATE};
use ragway_core::domain::session::Message;
use tera::{Context, Tera};
use tracing::warn;

const EMPTY_CONTEXT: &str = "No relevant context was found for this question.";

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContextWindow {
    pub prompt: String,
    pub chunks: Vec<RetrievedChunk>,
    pub dropped_chunks: usize,
    /// Index of the first prior message still inside the window.
    pub history_start: usize,
    pub estimated_tokens: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextAssembler {
    token_limit: usize,
}

impl ContextAssembler {
    pub fn new(token_limit: usize) -> Self {
        Self { token_limit }
    }

    /// Drops the lowest-ranked chunks first, then the oldest prior messages,
    /// until the estimate fits. The current query is never dropped.
    pub fn assemble(
        &self,
        query: &str,
        version: &CollectionVersion,
        mut chunks: Vec<RetrievedChunk>,
        history: &[Message],
    ) -> ContextWindow {
        rank_chunks(&mut chunks);
        let query_tokens = estimate_tokens(query);
        let mut history_tokens: usize =
            history.iter().map(|message| estimate_tokens(&message.content)).sum();
        let mut history_start = 0;
        let mut dropped_chunks = 0;

        loop {
            let prompt = render_prompt(&version.config.prompt_template, query, &chunks);
            let estimated_tokens = estimate_tokens(&prompt) + history_tokens + query_tokens;
            let fits = estimated_tokens <= self.token_limit;

            if !fits && chunks.pop().is_some() {
                dropped_chunks += 1;
                continue;
            }
            if !fits && history_start < history.len() {
                history_tokens -= estimate_tokens(&history[history_start].content);
                history_start += 1;
                continue;
            }
            if !fits {
                warn!(
                    event_name = "generation.context.over_budget",
                    collection_id = %version.collection_id,
                    estimated_tokens,
                    token_limit = self.token_limit,
                    "context exceeds budget after dropping all optional content"
                );
            }

            return ContextWindow {
                prompt,
                chunks,
                dropped_chunks,
                history_start,
                estimated_tokens,
            };
        }
    }
}

/// Renders a collection prompt template. Templates see `context`, `query`
/// and `source_count`; a template that fails to render falls back to the
/// built-in one.
pub fn render_prompt(template: &str, query: &str, chunks: &[RetrievedChunk]) -> String {
    let context = format_context(chunks);
    let mut vars = Context::new();
    vars.insert("context", &context);
    vars.insert("query", query);
    vars.insert("source_count", &chunks.len());

    match Tera::one_off(template, &vars, false) {
        Ok(prompt) => prompt,
        Err(error) => {
            warn!(
                event_name = "generation.prompt.template_failed",
                error = %error,
                "collection prompt template failed to render, using default"
            );
            Tera::one_off(DEFAULT_PROMPT_TEMPLATE, &vars, false)
                .unwrap_or_else(|_| format!("Context:\n{context}\n\nQuestion: {query}"))
        }
    }
}

fn format_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return EMPTY_CONTEXT.to_owned();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| format!("[Source {}] {}", index + 1, chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
