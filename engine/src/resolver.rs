//! RAG resolver: retrieval, context assembly and grounded generation.
//!
//! The resolver only handles the slow path; the FAQ fast path and the
//! threshold decision live in the router. Every failure inside the
//! resolver degrades to a user-safe string so the request path never
//! surfaces an error.

use log::{debug, warn};

use crate::provider::Provider;
use crate::store::Retriever;
use crate::types::ConversationTurn;

/// Returned when retrieval produces no usable context. The generator
/// is never invoked in that case; an empty context must not be
/// hallucinated over.
pub const INSUFFICIENT_INFORMATION: &str =
    "I apologize, but I don't have enough information to answer that question properly.";

/// Returned when the generation call itself fails.
pub const GENERATION_APOLOGY: &str =
    "I'm sorry, something went wrong while preparing your answer. Please try again in a moment.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant for a business. \
Answer the user's question using ONLY the provided Context Information and Conversation History. \
If the answer is not in the context, politely say you don't know.";

/// Configuration knobs for the resolver, split out so tests can build
/// one without a full [`crate::config::EngineConfig`].
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// How many chunks to retrieve.
    pub top_k: usize,
    /// Character budget for the concatenated context block.
    pub max_context_chars: usize,
    /// How many trailing history turns to fold into the prompt.
    pub max_history_turns: usize,
    /// Generation temperature.
    pub temperature: f32,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 8000,
            max_history_turns: 4,
            temperature: 0.2,
        }
    }
}

/// Retrieval-augmented answer synthesis.
pub struct RagResolver {
    retriever: std::sync::Arc<dyn Retriever>,
    provider: std::sync::Arc<dyn Provider>,
    options: ResolverOptions,
}

impl RagResolver {
    pub fn new(
        retriever: std::sync::Arc<dyn Retriever>,
        provider: std::sync::Arc<dyn Provider>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            retriever,
            provider,
            options,
        }
    }

    /// Produce a grounded answer for `query`.
    ///
    /// Never returns an error: retrieval failures and empty retrievals
    /// yield the insufficient-information string, generation failures
    /// yield an apology.
    pub async fn answer(&self, query: &str, history: Option<&[ConversationTurn]>) -> String {
        let chunks = match self.retriever.search(query, self.options.top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("retrieval failed: {e}");
                return INSUFFICIENT_INFORMATION.to_string();
            }
        };

        if chunks.is_empty() {
            debug!("no chunks retrieved, declining without generation");
            return INSUFFICIENT_INFORMATION.to_string();
        }

        let user_prompt = self.build_user_prompt(query, &chunks, history);

        match self
            .provider
            .generate(SYSTEM_PROMPT, &user_prompt, self.options.temperature, false)
            .await
        {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => {
                warn!("generator returned empty content");
                GENERATION_APOLOGY.to_string()
            }
            Err(e) => {
                warn!("generation failed: {e}");
                GENERATION_APOLOGY.to_string()
            }
        }
    }

    /// Assemble the user block: history, then context, then question.
    ///
    /// Chunks arrive most-similar first and are joined with a blank
    /// line; the concatenation is truncated tail-first to the
    /// character budget, so the least similar content is cut.
    fn build_user_prompt(
        &self,
        query: &str,
        chunks: &[String],
        history: Option<&[ConversationTurn]>,
    ) -> String {
        let mut context = chunks.join("\n\n");
        if context.len() > self.options.max_context_chars {
            let mut cut = self.options.max_context_chars;
            while !context.is_char_boundary(cut) {
                cut -= 1;
            }
            context.truncate(cut);
        }

        let history_block = history
            .map(|turns| render_history(turns, self.options.max_history_turns))
            .unwrap_or_default();

        format!(
            "Conversation History:\n{history_block}\n\nContext Information:\n{context}\n\nUser Question: {query}"
        )
    }
}

/// Render the most recent `max_turns` turns as `"<Role>: <content>"`
/// lines in chronological order.
fn render_history(turns: &[ConversationTurn], max_turns: usize) -> String {
    let start = turns.len().saturating_sub(max_turns);
    turns[start..]
        .iter()
        .map(|t| format!("{}: {}", t.role.display_name(), t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
