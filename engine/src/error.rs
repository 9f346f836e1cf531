use thiserror::Error;

/// Errors that can occur while resolving an answer.
///
/// Per-request embedding, generation and retrieval failures are caught
/// close to where they happen and degrade to safe fallback answers;
/// only `Config` is meant to abort startup.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("generation provider error: {0}")]
    Generation(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("embedding cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<lancedb::Error> for EngineError {
    fn from(e: lancedb::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Cache(e.to_string())
    }
}
