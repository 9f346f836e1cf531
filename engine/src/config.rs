//! Engine configuration.
//!
//! One `EngineConfig` is loaded at process start and injected into the
//! components built from it. Provider credentials are read from an
//! environment variable rather than stored in the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Which provider backs embedding and generation calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI or any OpenAI-compatible endpoint (Mistral, DeepSeek, ...).
    Openai,
    /// Anthropic. Generation only; pair with another embedding source.
    Anthropic,
    /// Local Ollama instance. No API key required.
    Ollama,
}

/// Engine configuration.
///
/// Every field has a default so a partial JSON config file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backing provider for embeddings and generation.
    pub provider: ProviderKind,
    /// Chat/generation model name.
    pub chat_model: String,
    /// Embedding model name.
    pub embedding_model: String,
    /// API endpoint override. Defaults per provider when `None`.
    pub endpoint: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Embedding dimensionality. Fixed at index creation; every vector
    /// inserted or queried must match it.
    pub embedding_dims: usize,
    /// Cosine similarity gate for the FAQ fast path.
    pub similarity_threshold: f32,
    /// How many chunks the RAG resolver retrieves.
    pub top_k: usize,
    /// Character budget for the assembled context block.
    pub max_context_chars: usize,
    /// How many trailing history turns are folded into the prompt.
    pub max_history_turns: usize,
    /// Generation temperature. Low values favor groundedness.
    pub temperature: f32,
    /// Per-request timeout for provider calls, in seconds.
    pub request_timeout_secs: u64,
    /// FAQ knowledge file (JSON list of question/answer entries).
    pub knowledge_file: PathBuf,
    /// On-disk embedding cache blob for the knowledge file.
    pub cache_file: PathBuf,
    /// LanceDB directory for the document vector index.
    pub index_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            chat_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            endpoint: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            embedding_dims: 1536,
            similarity_threshold: 0.8,
            top_k: 5,
            max_context_chars: 8000,
            max_history_turns: 4,
            temperature: 0.2,
            request_timeout_secs: 30,
            knowledge_file: PathBuf::from("data/faq.json"),
            cache_file: PathBuf::from("data/faq_cache.bin"),
            index_dir: PathBuf::from("data/vectors.lance"),
        }
    }
}

impl EngineConfig {
    /// Configuration for OpenAI models.
    pub fn openai(chat_model: &str, embedding_model: &str) -> Self {
        Self {
            provider: ProviderKind::Openai,
            chat_model: chat_model.to_string(),
            embedding_model: embedding_model.to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            ..Self::default()
        }
    }

    /// Configuration for a local Ollama instance.
    pub fn ollama(endpoint: &str, chat_model: &str, embedding_model: &str, dims: usize) -> Self {
        Self {
            provider: ProviderKind::Ollama,
            chat_model: chat_model.to_string(),
            embedding_model: embedding_model.to_string(),
            endpoint: Some(endpoint.to_string()),
            api_key_env: None,
            embedding_dims: dims,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the API key from the configured environment variable.
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }

    /// Validate settings that must be caught at startup, not per-request.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(EngineError::Config(format!(
                "similarity_threshold {} outside cosine range [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.embedding_dims == 0 {
            return Err(EngineError::Config(
                "embedding_dims must be nonzero".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(EngineError::Config("top_k must be nonzero".to_string()));
        }
        if self.provider != ProviderKind::Ollama && self.get_api_key().is_none() {
            let var = self.api_key_env.as_deref().unwrap_or("API_KEY");
            return Err(EngineError::Config(format!(
                "no API key found; set the {var} environment variable"
            )));
        }
        Ok(())
    }
}
