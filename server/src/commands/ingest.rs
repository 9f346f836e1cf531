//! Document ingestion and FAQ synthesis commands.

use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;

use answerkit_engine::config::EngineConfig;
use answerkit_engine::ingest::{generate_faq, ingest_dir, write_knowledge_file};
use answerkit_engine::provider::build_provider;
use answerkit_engine::store::VectorIndex;

use crate::exit_codes::EXIT_SUCCESS;

pub struct IngestArgs {
    pub dir: PathBuf,
    pub generate_faq: bool,
}

/// Chunk and index documents; optionally distill a draft FAQ from the
/// resulting corpus. Only the provider and index are built here; the
/// FAQ embedding cache refreshes on the next `serve` or `ask`.
pub async fn execute(config: EngineConfig, args: IngestArgs) -> anyhow::Result<i32> {
    config.validate()?;
    let provider = build_provider(&config)?;
    let index = Arc::new(
        VectorIndex::open(
            &config.index_dir.to_string_lossy(),
            config.embedding_dims,
            provider.clone(),
        )
        .await?,
    );

    let added = ingest_dir(&args.dir, &index).await?;
    println!(
        "{} {} chunks indexed ({} total)",
        "ok:".green(),
        added,
        index.count().await?
    );

    if args.generate_faq {
        let entries = generate_faq(&index, provider.as_ref()).await?;
        write_knowledge_file(&config.knowledge_file, &entries)?;
        println!(
            "{} {} draft FAQ entries written to {} (review before serving)",
            "ok:".green(),
            entries.len(),
            config.knowledge_file.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
