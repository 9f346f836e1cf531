//! Document ingestion and FAQ synthesis.
//!
//! Splits source documents into fixed-size chunks for the vector
//! index, and can distill the indexed corpus into a draft FAQ
//! knowledge file for an operator to review.

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::error::EngineError;
use crate::provider::Provider;
use crate::store::VectorIndex;
use crate::types::FaqEntry;

/// Characters per chunk.
pub const CHUNK_SIZE: usize = 1000;

/// Upper bound on corpus characters fed to FAQ synthesis.
const FAQ_CORPUS_CAP: usize = 50_000;

const FAQ_SYSTEM_PROMPT: &str = "You are a knowledge engineer. Given business documentation, \
produce a JSON object with a single key \"faqs\": an array of objects, each with \"questions\" \
(an array of 2-4 phrasings of the same question) and \"answer\" (a concise, factual answer drawn \
only from the documentation). Cover the most commonly asked topics. Respond with JSON only.";

#[derive(Deserialize)]
struct FaqDocument {
    faqs: Vec<FaqEntry>,
}

/// Split text into chunks of at most [`CHUNK_SIZE`] characters, on
/// character boundaries. Whitespace-only chunks are dropped.
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_SIZE)
        .map(|c| c.iter().collect::<String>())
        .filter(|c| !c.trim().is_empty())
        .collect()
}

/// Read every `.txt` and `.md` file directly under `dir`, chunk them,
/// and append the chunks to the index. Returns the number of chunks
/// added.
pub async fn ingest_dir(dir: &Path, index: &VectorIndex) -> Result<usize, EngineError> {
    let mut chunks = Vec::new();
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        let is_doc = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md")
        );
        if !is_doc {
            continue;
        }
        match fs::read_to_string(&path) {
            Ok(text) => {
                let file_chunks = chunk_text(&text);
                info!("{}: {} chunks", path.display(), file_chunks.len());
                chunks.extend(file_chunks);
            }
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }

    if chunks.is_empty() {
        warn!("no document chunks found under {}", dir.display());
        return Ok(0);
    }
    index.add(&chunks).await
}

/// Distill the indexed corpus into FAQ entries via the provider.
///
/// The corpus is truncated to a fixed cap before prompting; the
/// provider is asked for strict JSON, with code fences stripped in
/// case the model wraps its output anyway.
pub async fn generate_faq(
    index: &VectorIndex,
    provider: &dyn Provider,
) -> Result<Vec<FaqEntry>, EngineError> {
    let mut corpus = index.all_text().await?;
    if corpus.trim().is_empty() {
        return Err(EngineError::Config(
            "vector index is empty; ingest documents before generating a FAQ".to_string(),
        ));
    }
    if corpus.len() > FAQ_CORPUS_CAP {
        let mut cut = FAQ_CORPUS_CAP;
        while !corpus.is_char_boundary(cut) {
            cut -= 1;
        }
        corpus.truncate(cut);
    }

    let user_prompt = format!("Documentation:\n{corpus}");
    let raw = provider
        .generate(FAQ_SYSTEM_PROMPT, &user_prompt, 0.2, true)
        .await?;

    let cleaned = strip_code_fences(&raw);
    let doc: FaqDocument = serde_json::from_str(cleaned)
        .map_err(|e| EngineError::Generation(format!("provider returned invalid FAQ JSON: {e}")))?;

    let entries: Vec<FaqEntry> = doc
        .faqs
        .into_iter()
        .filter(|e| !e.questions.is_empty() && !e.answer.trim().is_empty())
        .collect();
    info!("generated {} FAQ entries", entries.len());
    Ok(entries)
}

/// Write entries to the knowledge file as pretty-printed JSON.
pub fn write_knowledge_file(path: &Path, entries: &[FaqEntry]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(entries)?)?;
    Ok(())
}

/// Strip a single leading/trailing markdown code fence, if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
