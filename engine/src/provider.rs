//! Provider adapters for embedding and text generation.
//!
//! One capability trait, one implementation per backing provider,
//! selected by configuration at construction time. OpenAI-compatible
//! endpoints and Ollama support both capabilities; Anthropic exposes
//! generation only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ProviderKind};
use crate::error::EngineError;

/// Capability to turn text into vectors and prompts into text.
///
/// All methods are potentially slow network calls; callers treat
/// failures as soft and degrade rather than crash the request.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Embed a single text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// Embed a batch of texts. Output vectors map 1:1, in order, to the
    /// input texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;

    /// Generate text from a system instruction and a user prompt.
    ///
    /// `json_mode` asks the provider for a JSON object response where
    /// supported; providers without the capability ignore it.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String, EngineError>;

    /// Dimensionality of the vectors this provider produces.
    fn dimensions(&self) -> usize;

    /// Embedding model name.
    fn model_name(&self) -> &str;
}

/// Build the configured provider.
pub fn build_provider(config: &EngineConfig) -> Result<Arc<dyn Provider>, EngineError> {
    config.validate()?;
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.provider {
        ProviderKind::Openai => Ok(Arc::new(OpenAiProvider::new(
            config.get_api_key().unwrap_or_default(),
            config.chat_model.clone(),
            config.embedding_model.clone(),
            config.endpoint.clone(),
            config.embedding_dims,
            timeout,
        )?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(
            config.get_api_key().unwrap_or_default(),
            config.chat_model.clone(),
            config.endpoint.clone(),
            config.embedding_dims,
            timeout,
        )?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(
            config.chat_model.clone(),
            config.embedding_model.clone(),
            config.endpoint.clone(),
            config.embedding_dims,
            timeout,
        )?)),
    }
}

/// Embed `texts` in request-sized batches, preserving order.
///
/// Batch i's output vectors map 1:1, in order, to batch i's inputs, so
/// the concatenation preserves the overall input order.
pub async fn embed_in_batches(
    provider: &dyn Provider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EngineError> {
    let mut all = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = provider.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(EngineError::Embedding(format!(
                "provider returned {} vectors for a batch of {}",
                vectors.len(),
                batch.len()
            )));
        }
        all.extend(vectors);
    }
    Ok(all)
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client, EngineError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(EngineError::from)
}

/// Embedding APIs behave better without raw newlines in the input.
fn sanitize(text: &str) -> String {
    text.replace('\n', " ")
}

// --- OpenAI-compatible wire types ---

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// OpenAI provider.
///
/// Works with OpenAI's API and any compatible endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
    dims: usize,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        chat_model: String,
        embedding_model: String,
        endpoint: Option<String>,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint: endpoint.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            chat_model,
            embedding_model,
            dims,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Embedding("empty response from OpenAI".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!("{}/embeddings", self.endpoint);
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.iter().map(|t| sanitize(t)).collect(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let result: EmbeddingResponse = response.json().await?;
        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String, EngineError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let request = ChatRequest {
            model: self.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature,
            response_format: json_mode.then(|| serde_json::json!({"type": "json_object"})),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let result: ChatResponse = response.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Generation("no response content".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

// --- Anthropic wire types ---

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

/// Anthropic provider. Generation only.
///
/// The Anthropic API has no embedding endpoint, so `embed` always
/// fails; deployments using Anthropic for chat pair it with another
/// embedding source.
pub struct AnthropicProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: Option<String>,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint: endpoint.unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
        Err(EngineError::Embedding(
            "Anthropic does not expose an embedding API".to_string(),
        ))
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Err(EngineError::Embedding(
            "Anthropic does not expose an embedding API".to_string(),
        ))
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        _json_mode: bool,
    ) -> Result<String, EngineError> {
        let url = format!("{}/messages", self.endpoint);
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            temperature,
            system: system_prompt.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user_prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "Anthropic API error {status}: {body}"
            )));
        }

        let result: AnthropicResponse = response.json().await?;
        result
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| EngineError::Generation("no response content".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// --- Ollama wire types ---

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessageResponse,
}

#[derive(Debug, Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

/// Ollama provider for local models. No API key required.
pub struct OllamaProvider {
    client: reqwest::Client,
    endpoint: String,
    chat_model: String,
    embedding_model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(
        chat_model: String,
        embedding_model: String,
        endpoint: Option<String>,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint: endpoint.unwrap_or_else(|| "http://localhost:11434".to_string()),
            chat_model,
            embedding_model,
            dims,
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Embedding("empty response from Ollama".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!("{}/api/embed", self.endpoint);
        let request = OllamaEmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.iter().map(|t| sanitize(t)).collect(),
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!(
                "Ollama API error {status}: {body}"
            )));
        }

        let result: OllamaEmbeddingResponse = response.json().await?;
        Ok(result.embeddings)
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String, EngineError> {
        let url = format!("{}/api/chat", self.endpoint);
        let request = OllamaChatRequest {
            model: self.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            stream: false,
            options: OllamaOptions { temperature },
            format: json_mode.then(|| "json".to_string()),
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "Ollama API error {status}: {body}"
            )));
        }

        let result: OllamaChatResponse = response.json().await?;
        Ok(result.message.content)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[test]
    fn openai_provider_defaults() {
        let provider = OpenAiProvider::new(
            "test-key".to_string(),
            "gpt-4o".to_string(),
            "text-embedding-3-small".to_string(),
            None,
            1536,
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(provider.dimensions(), 1536);
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.endpoint, "https://api.openai.com/v1");
    }

    #[test]
    fn ollama_provider_defaults() {
        let provider = OllamaProvider::new(
            "llama3".to_string(),
            "nomic-embed-text".to_string(),
            None,
            768,
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(provider.dimensions(), 768);
        assert_eq!(provider.endpoint, "http://localhost:11434");
    }

    #[tokio::test]
    async fn anthropic_embed_is_a_soft_error() {
        let provider = AnthropicProvider::new(
            "key".to_string(),
            "claude-sonnet-4-5".to_string(),
            None,
            1536,
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(matches!(
            provider.embed("hello").await,
            Err(EngineError::Embedding(_))
        ));
    }

    #[test]
    fn sanitize_strips_newlines() {
        assert_eq!(sanitize("a\nb\nc"), "a b c");
    }

    #[tokio::test]
    async fn batched_embedding_preserves_order() {
        let provider = MockProvider::new(4);
        let texts: Vec<String> = (0..7).map(|i| format!("text {i}")).collect();

        let batched = embed_in_batches(&provider, &texts, 3).await.unwrap();
        assert_eq!(batched.len(), texts.len());

        // Must agree with embedding each text individually, per index.
        for (i, text) in texts.iter().enumerate() {
            let single = provider.embed(text).await.unwrap();
            assert_eq!(batched[i], single, "order broken at index {i}");
        }
    }

    #[tokio::test]
    async fn build_provider_selects_by_kind() {
        let config = crate::config::EngineConfig::ollama(
            "http://localhost:11434",
            "llama3",
            "nomic-embed-text",
            768,
        );
        let provider = build_provider(&config).unwrap();
        assert_eq!(provider.dimensions(), 768);
        assert_eq!(provider.model_name(), "nomic-embed-text");
    }
}
