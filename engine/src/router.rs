//! Hybrid routing between the FAQ fast path and the RAG fallback.

use log::{debug, info};

use crate::matcher::SemanticMatcher;
use crate::resolver::RagResolver;
use crate::types::{AnswerSource, ConversationTurn, RouterResponse};

/// Routes each query to the cheapest path that can answer it.
///
/// The similarity threshold is applied here and nowhere else: the
/// matcher reports its best candidate and score, the router decides.
/// A best score at or above the threshold serves the cached answer;
/// anything below falls through to retrieval-augmented generation.
pub struct HybridRouter {
    matcher: SemanticMatcher,
    resolver: RagResolver,
    threshold: f32,
}

impl HybridRouter {
    pub fn new(matcher: SemanticMatcher, resolver: RagResolver, threshold: f32) -> Self {
        Self {
            matcher,
            resolver,
            threshold,
        }
    }

    /// Answer a query, reporting which path produced the answer.
    pub async fn get_response(
        &self,
        query: &str,
        history: Option<&[ConversationTurn]>,
    ) -> RouterResponse {
        let (best, score) = self.matcher.find_best_match(query).await;

        if let Some(m) = best {
            if score >= self.threshold {
                info!(
                    "FAQ hit at {score:.4} (threshold {:.2}): {:?}",
                    self.threshold, m.question
                );
                return RouterResponse {
                    response: m.answer,
                    source: AnswerSource::Faq,
                    similarity_score: score,
                };
            }
            debug!(
                "best FAQ candidate {:?} scored {score:.4}, below threshold {:.2}",
                m.question, self.threshold
            );
        }

        let response = self.resolver.answer(query, history).await;
        RouterResponse {
            response,
            source: AnswerSource::Rag,
            similarity_score: score,
        }
    }
}
