//! Process-wide application context.
//!
//! Everything a command needs is built here, once, from the loaded
//! configuration and passed down explicitly. There is no global state;
//! tests construct their own contexts with whatever pieces they need.

use std::sync::Arc;

use anyhow::Context as _;
use log::info;

use answerkit_engine::config::EngineConfig;
use answerkit_engine::faq::FaqCache;
use answerkit_engine::matcher::SemanticMatcher;
use answerkit_engine::provider::{Provider, build_provider};
use answerkit_engine::resolver::{RagResolver, ResolverOptions};
use answerkit_engine::router::HybridRouter;
use answerkit_engine::store::VectorIndex;

/// All long-lived components, wired together.
pub struct AppContext {
    pub config: EngineConfig,
    pub provider: Arc<dyn Provider>,
    pub index: Arc<VectorIndex>,
    pub router: Arc<HybridRouter>,
}

impl AppContext {
    /// Build the full component graph from a validated configuration.
    ///
    /// This may embed the knowledge file if the on-disk cache is stale,
    /// so startup can take a provider round-trip.
    pub async fn init(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let provider = build_provider(&config).context("failed to build provider")?;

        let index = Arc::new(
            VectorIndex::open(
                &config.index_dir.to_string_lossy(),
                config.embedding_dims,
                provider.clone(),
            )
            .await
            .context("failed to open vector index")?,
        );

        let cache =
            FaqCache::load_or_build(&config.knowledge_file, &config.cache_file, provider.as_ref())
                .await
                .context("failed to load FAQ knowledge")?;
        info!(
            "FAQ cache ready: {} question variants across {} entries",
            cache.len(),
            cache.entry_count()
        );

        let matcher = SemanticMatcher::new(cache, provider.clone());
        let resolver = RagResolver::new(
            index.clone(),
            provider.clone(),
            ResolverOptions {
                top_k: config.top_k,
                max_context_chars: config.max_context_chars,
                max_history_turns: config.max_history_turns,
                temperature: config.temperature,
            },
        );
        let router = Arc::new(HybridRouter::new(
            matcher,
            resolver,
            config.similarity_threshold,
        ));

        Ok(Self {
            config,
            provider,
            index,
            router,
        })
    }
}
