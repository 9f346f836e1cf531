//! FAQ knowledge cache.
//!
//! Loads the curated knowledge file, flattens every question variant,
//! and precomputes one embedding per question. The embeddings are
//! persisted to an opaque bincode blob next to the knowledge file and
//! regenerated wholesale whenever the source looks newer than the
//! cache or the entry counts disagree. The blob is never patched in
//! place.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::provider::{Provider, embed_in_batches};
use crate::types::FaqEntry;

/// Upper bound on texts per embedding request, within provider limits.
pub const EMBED_BATCH_SIZE: usize = 500;

/// On-disk cache format. Keyed positionally to the knowledge file.
#[derive(Serialize, Deserialize)]
struct CacheBlob {
    /// Number of entries in the knowledge file the blob was built from.
    source_entry_count: usize,
    /// Embedding dimensionality the blob was built with.
    dims: usize,
    /// Flattened question variants, in knowledge-file order.
    questions: Vec<String>,
    /// For each flattened question, the index of its entry.
    answer_index: Vec<usize>,
    /// One vector per flattened question.
    vectors: Vec<Vec<f32>>,
}

/// Precomputed embeddings for the FAQ knowledge file.
///
/// Built once at startup and read-only afterwards; a refresh means
/// constructing a new cache.
pub struct FaqCache {
    entries: Vec<FaqEntry>,
    questions: Vec<String>,
    answer_index: Vec<usize>,
    vectors: Vec<Vec<f32>>,
}

impl FaqCache {
    /// An empty cache: the fast path is disabled, every lookup misses.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            questions: Vec::new(),
            answer_index: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Load the knowledge file and reuse or rebuild the embedding cache.
    ///
    /// A missing knowledge file disables the fast path with a warning
    /// rather than failing startup; a present but malformed file is a
    /// configuration error operators should see immediately.
    pub async fn load_or_build(
        knowledge_file: &Path,
        cache_file: &Path,
        provider: &dyn Provider,
    ) -> Result<Self, EngineError> {
        let raw = match fs::read_to_string(knowledge_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "knowledge file {} not found; FAQ matching disabled",
                    knowledge_file.display()
                );
                return Ok(Self::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<FaqEntry> = serde_json::from_str(&raw).map_err(|e| {
            EngineError::Config(format!(
                "malformed knowledge file {}: {e}",
                knowledge_file.display()
            ))
        })?;

        if entries.is_empty() {
            warn!("knowledge file {} is empty", knowledge_file.display());
            return Ok(Self::empty());
        }

        let mut questions = Vec::new();
        let mut answer_index = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            for q in &entry.questions {
                questions.push(q.clone());
                answer_index.push(i);
            }
        }

        if let Some(blob) = load_cache_if_fresh(knowledge_file, cache_file, &entries, provider) {
            info!(
                "reusing embedding cache {} ({} questions)",
                cache_file.display(),
                blob.vectors.len()
            );
            return Ok(Self {
                entries,
                questions: blob.questions,
                answer_index: blob.answer_index,
                vectors: blob.vectors,
            });
        }

        info!(
            "encoding {} question variants from {}",
            questions.len(),
            knowledge_file.display()
        );
        let vectors = embed_in_batches(provider, &questions, EMBED_BATCH_SIZE).await?;

        let blob = CacheBlob {
            source_entry_count: entries.len(),
            dims: provider.dimensions(),
            questions: questions.clone(),
            answer_index: answer_index.clone(),
            vectors: vectors.clone(),
        };
        if let Some(parent) = cache_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(cache_file, bincode::serialize(&blob)?)?;

        Ok(Self {
            entries,
            questions,
            answer_index,
            vectors,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Number of flattened question variants in the cache.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Number of entries in the source knowledge file.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub(crate) fn question(&self, i: usize) -> &str {
        &self.questions[i]
    }

    /// Entry index and answer for flattened question `i`.
    pub(crate) fn answer(&self, i: usize) -> (usize, &str) {
        let entry_index = self.answer_index[i];
        (entry_index, &self.entries[entry_index].answer)
    }
}

/// Return the cached blob when it can be reused as-is.
///
/// The staleness check is coarse but sufficient: the blob is discarded
/// when the knowledge file's mtime is newer, when the entry counts
/// disagree, or when the embedding dimensionality changed.
fn load_cache_if_fresh(
    knowledge_file: &Path,
    cache_file: &Path,
    entries: &[FaqEntry],
    provider: &dyn Provider,
) -> Option<CacheBlob> {
    let knowledge_mtime = mtime(knowledge_file)?;
    let cache_mtime = mtime(cache_file)?;
    if knowledge_mtime > cache_mtime {
        return None;
    }

    let bytes = fs::read(cache_file).ok()?;
    let blob: CacheBlob = bincode::deserialize(&bytes).ok()?;

    if blob.source_entry_count != entries.len()
        || blob.dims != provider.dimensions()
        || blob.vectors.len() != blob.questions.len()
        || blob.answer_index.len() != blob.questions.len()
    {
        return None;
    }
    Some(blob)
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn write_knowledge(path: &Path, entries: &[FaqEntry]) {
        fs::write(path, serde_json::to_string(entries).unwrap()).unwrap();
    }

    fn sample_entries() -> Vec<FaqEntry> {
        vec![
            FaqEntry {
                questions: vec![
                    "What are your hours?".to_string(),
                    "When are you open?".to_string(),
                ],
                answer: "9am-5pm.".to_string(),
            },
            FaqEntry {
                questions: vec!["Where are you located?".to_string()],
                answer: "123 Main St.".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn builds_cache_from_knowledge_file() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        let cache_file = dir.path().join("faq_cache.bin");
        write_knowledge(&knowledge, &sample_entries());

        let provider = MockProvider::new(8);
        let cache = FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();

        // Three flattened questions across two entries.
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.entry_count(), 2);
        assert_eq!(cache.answer(0), (0, "9am-5pm."));
        assert_eq!(cache.answer(2), (1, "123 Main St."));
        assert!(cache_file.exists());
    }

    #[tokio::test]
    async fn reuses_fresh_cache_without_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        let cache_file = dir.path().join("faq_cache.bin");
        write_knowledge(&knowledge, &sample_entries());

        let provider = MockProvider::new(8);
        FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();
        let calls_after_build = provider.embed_calls.load(Ordering::SeqCst);

        let cache = FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(
            provider.embed_calls.load(Ordering::SeqCst),
            calls_after_build,
            "second load must not call the provider"
        );
    }

    #[tokio::test]
    async fn rebuilds_when_knowledge_file_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        let cache_file = dir.path().join("faq_cache.bin");
        write_knowledge(&knowledge, &sample_entries());

        let provider = MockProvider::new(8);
        FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();

        // Rewrite the knowledge file (same entry count) after the cache.
        std::thread::sleep(Duration::from_millis(50));
        let mut entries = sample_entries();
        entries[1].answer = "456 Elm St.".to_string();
        write_knowledge(&knowledge, &entries);

        let before = provider.embed_calls.load(Ordering::SeqCst);
        let cache = FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();
        assert!(
            provider.embed_calls.load(Ordering::SeqCst) > before,
            "stale cache must trigger a rebuild"
        );
        assert_eq!(cache.answer(2), (1, "456 Elm St."));
    }

    #[tokio::test]
    async fn rebuilds_when_entry_count_changes() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        let cache_file = dir.path().join("faq_cache.bin");
        write_knowledge(&knowledge, &sample_entries());

        let provider = MockProvider::new(8);
        FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();

        let mut entries = sample_entries();
        entries.push(FaqEntry {
            questions: vec!["Do you deliver?".to_string()],
            answer: "Yes, within 10km.".to_string(),
        });
        write_knowledge(&knowledge, &entries);

        let cache = FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();
        assert_eq!(cache.entry_count(), 3);
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn missing_knowledge_file_disables_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::new(8);
        let cache = FaqCache::load_or_build(
            &dir.path().join("missing.json"),
            &dir.path().join("cache.bin"),
            &provider,
        )
        .await
        .unwrap();
        assert!(cache.is_empty());
        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_knowledge_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        fs::write(&knowledge, "{not json").unwrap();

        let provider = MockProvider::new(8);
        let result =
            FaqCache::load_or_build(&knowledge, &dir.path().join("cache.bin"), &provider).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn rebuilds_when_dimensions_change() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("faq.json");
        let cache_file = dir.path().join("faq_cache.bin");
        write_knowledge(&knowledge, &sample_entries());

        let provider = MockProvider::new(8);
        FaqCache::load_or_build(&knowledge, &cache_file, &provider)
            .await
            .unwrap();

        let wider = MockProvider::new(16);
        let cache = FaqCache::load_or_build(&knowledge, &cache_file, &wider)
            .await
            .unwrap();
        assert_eq!(cache.vectors()[0].len(), 16);
    }
}
