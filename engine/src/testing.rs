//! Shared mocks for engine tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::matcher::normalize;
use crate::provider::Provider;
use crate::store::Retriever;

/// A scripted provider with call counters.
///
/// Unknown texts get a deterministic pseudo-random unit vector, so two
/// different texts are very unlikely to collide and the same text
/// always embeds identically.
pub(crate) struct MockProvider {
    dims: usize,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    pub fail_embed: bool,
    /// Fixed generation reply; `None` makes generation fail.
    pub generate_reply: Option<String>,
    /// When set, `generate` returns the user prompt itself, which lets
    /// tests assert on the assembled prompt contents.
    pub echo_user_prompt: bool,
    pub embed_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    /// Recorded (system_prompt, user_prompt) pairs.
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            embeddings: Mutex::new(HashMap::new()),
            fail_embed: false,
            generate_reply: Some("generated answer".to_string()),
            echo_user_prompt: false,
            embed_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_embeddings(dims: usize) -> Self {
        Self {
            fail_embed: true,
            ..Self::new(dims)
        }
    }

    pub fn failing_generation(dims: usize) -> Self {
        Self {
            generate_reply: None,
            ..Self::new(dims)
        }
    }

    pub fn echoing(dims: usize) -> Self {
        Self {
            echo_user_prompt: true,
            ..Self::new(dims)
        }
    }

    /// Script a fixed embedding for a given text.
    pub fn with_embedding(self, text: &str, vector: Vec<f32>) -> Self {
        self.embeddings
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.embeddings.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut state = text
            .bytes()
            .fold(0xcbf29ce484222325u64, |acc, b| {
                acc.wrapping_mul(0x100000001b3).wrapping_add(b as u64)
            });
        let mut v = Vec::with_capacity(self.dims);
        for _ in 0..self.dims {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            v.push(((state >> 33) as f32 / (1u64 << 32) as f32) - 0.5);
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embed {
            return Err(EngineError::Embedding("mock embed failure".to_string()));
        }
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embed {
            return Err(EngineError::Embedding("mock embed failure".to_string()));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _temperature: f32,
        _json_mode: bool,
    ) -> Result<String, EngineError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));
        if self.echo_user_prompt {
            return Ok(user_prompt.to_string());
        }
        self.generate_reply
            .clone()
            .ok_or_else(|| EngineError::Generation("mock generation failure".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }
}

/// A retriever serving a fixed chunk list.
pub(crate) struct MockRetriever {
    pub chunks: Vec<String>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl MockRetriever {
    pub fn new(chunks: Vec<String>) -> Self {
        Self {
            chunks,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn failing() -> Self {
        Self {
            chunks: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<String>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::Retrieval("mock retrieval failure".to_string()));
        }
        Ok(self.chunks.iter().take(limit).cloned().collect())
    }
}
