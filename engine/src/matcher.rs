//! Semantic FAQ matcher.
//!
//! Embeds an incoming query and scans the precomputed FAQ vectors for
//! the closest cached question. The matcher never applies the
//! similarity threshold; that decision lives in the router so it
//! exists in exactly one place.

use log::{debug, warn};

use crate::faq::FaqCache;
use crate::provider::Provider;
use crate::types::FaqMatch;

/// Cosine similarity of two vectors. Zero-magnitude inputs score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Embedding-based lookup over the FAQ knowledge cache.
pub struct SemanticMatcher {
    cache: FaqCache,
    provider: std::sync::Arc<dyn Provider>,
}

impl SemanticMatcher {
    pub fn new(cache: FaqCache, provider: std::sync::Arc<dyn Provider>) -> Self {
        Self { cache, provider }
    }

    /// Find the cached FAQ question closest to `query`.
    ///
    /// Returns `(None, 0.0)` when the cache is empty (without spending
    /// a provider call) and when embedding the query fails; both mean
    /// "no match, proceed to the fallback", never a hard failure.
    /// Ties break to the first entry in knowledge-file order.
    pub async fn find_best_match(&self, query: &str) -> (Option<FaqMatch>, f32) {
        if self.cache.is_empty() {
            return (None, 0.0);
        }

        let query_vec = match self.provider.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => {
                warn!("provider returned an empty query embedding");
                return (None, 0.0);
            }
            Err(e) => {
                warn!("query embedding failed, falling back to RAG: {e}");
                return (None, 0.0);
            }
        };

        let mut best_idx = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (i, vector) in self.cache.vectors().iter().enumerate() {
            let score = cosine_similarity(&query_vec, vector);
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }

        let (entry_index, answer) = self.cache.answer(best_idx);
        debug!(
            "best FAQ candidate {:?} scored {best_score:.4}",
            self.cache.question(best_idx)
        );
        (
            Some(FaqMatch {
                answer: answer.to_string(),
                question: self.cache.question(best_idx).to_string(),
                entry_index,
            }),
            best_score,
        )
    }

    /// Number of cached question variants.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
