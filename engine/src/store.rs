//! LanceDB vector index for ingested document chunks.
//!
//! Stores `(content, vector)` rows and serves nearest-neighbor lookups
//! by cosine distance. The index is append-only: chunks are immutable
//! once inserted and there is no update or delete path.

use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray,
    types::Float32Type,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::query::{ExecutableQuery, QueryBase};
use log::info;

use crate::error::EngineError;
use crate::faq::EMBED_BATCH_SIZE;
use crate::provider::{Provider, embed_in_batches};

const TABLE_NAME: &str = "documents";

/// Capability to fetch the chunks most similar to a query.
///
/// Implemented by [`VectorIndex`]; the resolver depends on this trait
/// so retrieval can be substituted in tests.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `limit` chunk contents, most similar first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, EngineError>;
}

/// LanceDB-backed vector index over document chunks.
///
/// The embedding dimension is fixed when the index is opened; a vector
/// of any other length is a fatal configuration error, not a
/// per-request one.
pub struct VectorIndex {
    db: lancedb::Connection,
    dims: usize,
    provider: Arc<dyn Provider>,
}

impl VectorIndex {
    /// Open or create an index at the given path.
    pub async fn open(
        path: &str,
        dims: usize,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, EngineError> {
        if provider.dimensions() != dims {
            return Err(EngineError::Config(format!(
                "index dimension {dims} does not match provider dimension {}",
                provider.dimensions()
            )));
        }
        let db = lancedb::connect(path).execute().await?;
        let index = Self { db, dims, provider };
        index.ensure_table().await?;
        Ok(index)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dims as i32,
                ),
                false,
            ),
        ]))
    }

    async fn ensure_table(&self) -> Result<(), EngineError> {
        let tables = self.db.table_names().execute().await?;
        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = self.schema();
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let batches = RecordBatchIterator::new(vec![Ok(empty_batch)], schema);
            self.db.create_table(TABLE_NAME, batches).execute().await?;
        }
        Ok(())
    }

    /// Embed and append chunks. Existing rows are never overwritten.
    pub async fn add(&self, chunks: &[String]) -> Result<usize, EngineError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let vectors = embed_in_batches(self.provider.as_ref(), chunks, EMBED_BATCH_SIZE).await?;
        for v in &vectors {
            if v.len() != self.dims {
                return Err(EngineError::Config(format!(
                    "provider returned a {}-dimensional vector for a {}-dimensional index",
                    v.len(),
                    self.dims
                )));
            }
        }

        let schema = self.schema();
        let contents = StringArray::from_iter_values(chunks.iter().map(|c| c.as_str()));
        let vector_array = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            vectors
                .into_iter()
                .map(|v| Some(v.into_iter().map(Some).collect::<Vec<_>>())),
            self.dims as i32,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(contents), Arc::new(vector_array) as Arc<dyn Array>],
        )
        .map_err(|e| EngineError::Store(format!("failed to create record batch: {e}")))?;

        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(batches).execute().await?;

        info!("added {} chunks to the vector index", chunks.len());
        Ok(chunks.len())
    }

    /// Concatenation of every stored chunk, for corpus-scale
    /// summarization. Callers cap how much of this they feed downstream.
    pub async fn all_text(&self) -> Result<String, EngineError> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let results: Vec<RecordBatch> = table
            .query()
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(|e| EngineError::Store(format!("failed to scan documents: {e}")))?;

        let mut parts = Vec::new();
        for batch in &results {
            if let Some(contents) = batch
                .column_by_name("content")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            {
                for i in 0..batch.num_rows() {
                    parts.push(contents.value(i).to_string());
                }
            }
        }
        Ok(parts.join(" "))
    }

    /// Number of stored chunks.
    pub async fn count(&self) -> Result<usize, EngineError> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let count = table.count_rows(None).await?;
        Ok(count)
    }
}

#[async_trait]
impl Retriever for VectorIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, EngineError> {
        let query_vec = self
            .provider
            .embed(query)
            .await
            .map_err(|e| EngineError::Retrieval(e.to_string()))?;
        if query_vec.len() != self.dims {
            return Err(EngineError::Config(format!(
                "query embedding has {} dimensions, index expects {}",
                query_vec.len(),
                self.dims
            )));
        }

        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let results: Vec<RecordBatch> = table
            .vector_search(query_vec.as_slice())
            .map_err(|e| EngineError::Store(format!("failed to build search query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await?
            .try_collect()
            .await
            .map_err(|e| EngineError::Store(format!("failed to execute search: {e}")))?;

        // LanceDB returns rows ordered by ascending `_distance`, which
        // for cosine distance is most-similar first.
        let mut chunks = Vec::new();
        for batch in &results {
            if let Some(contents) = batch
                .column_by_name("content")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            {
                for i in 0..batch.num_rows() {
                    chunks.push(contents.value(i).to_string());
                }
            }
        }
        Ok(chunks)
    }
}
