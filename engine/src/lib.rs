//! answerkit-engine: hybrid FAQ/RAG answer resolution
//!
//! This crate implements a two-tier question-answering engine:
//! - A semantic FAQ matcher: embedding-based lookup over a curated
//!   knowledge file, with an on-disk embedding cache.
//! - A RAG resolver: vector retrieval over ingested documents plus
//!   grounded text generation, used when no FAQ entry is close enough.
//!
//! The [`router::HybridRouter`] composes the two and is the single
//! place where the similarity threshold decision lives.
//!
//! # Example
//!
//! ```ignore
//! use answerkit_engine::config::EngineConfig;
//! use answerkit_engine::provider::build_provider;
//!
//! let config = EngineConfig::openai("gpt-4o", "text-embedding-3-small");
//! let provider = build_provider(&config)?;
//! ```

pub mod config;
pub mod error;
pub mod faq;
pub mod ingest;
pub mod matcher;
pub mod provider;
pub mod resolver;
pub mod router;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use error::EngineError;
pub use router::HybridRouter;
pub use types::{AnswerSource, ConversationTurn, Role, RouterResponse};
