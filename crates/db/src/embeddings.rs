use arrow_array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use chrono::Utc;
use foldex_core::DocumentChunk;
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::connection::{DbError, FolderDb, Result, escape_sql};
use crate::schema::embeddings_schema;

/// One vector-search hit from the embeddings table, before hydration.
#[derive(Debug, Clone)]
pub struct EmbeddingHit {
  pub chunk_id: String,
  pub document_id: String,
  pub model: String,
  /// Cosine similarity in [0, 1]-ish range (1 - distance).
  pub score: f32,
}

impl FolderDb {
  /// Insert embedding rows for chunks, 1:1 and positionally aligned.
  ///
  /// Only successful (chunk, vector) pairs reach this call, so the
  /// chunk ↔ embedding invariant holds after it returns.
  #[tracing::instrument(level = "trace", skip(self, pairs), fields(count = pairs.len()))]
  pub async fn add_embeddings(&self, pairs: &[(&DocumentChunk, Vec<f32>)]) -> Result<()> {
    if pairs.is_empty() {
      return Ok(());
    }

    let table = self.embeddings_table().await?;

    let chunk_ids: Vec<String> = pairs.iter().map(|(c, _)| c.id()).collect();
    let document_ids: Vec<String> = pairs.iter().map(|(c, _)| c.document_id.clone()).collect();
    let models: Vec<String> = pairs.iter().map(|_| self.model_id.clone()).collect();
    let created: Vec<i64> = pairs.iter().map(|_| Utc::now().timestamp_millis()).collect();

    let mut values = Vec::with_capacity(pairs.len() * self.vector_dim);
    for (_, vector) in pairs {
      let mut padded = vector.clone();
      padded.resize(self.vector_dim, 0.0);
      values.extend(padded);
    }

    let field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
    let vectors = FixedSizeListArray::try_new(
      field,
      self.vector_dim as i32,
      Arc::new(Float32Array::from(values)),
      None,
    )?;

    let batch = RecordBatch::try_new(
      embeddings_schema(self.vector_dim),
      vec![
        Arc::new(StringArray::from(chunk_ids)),
        Arc::new(StringArray::from(document_ids)),
        Arc::new(StringArray::from(models)),
        Arc::new(Int64Array::from(created)),
        Arc::new(vectors),
      ],
    )?;

    let batches = RecordBatchIterator::new(vec![Ok(batch)], embeddings_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Cosine vector search over the embeddings table.
  ///
  /// `filter` is an optional SQL predicate on embeddings columns
  /// (e.g. a document_id prefix).
  #[tracing::instrument(level = "trace", skip(self, query_vector))]
  pub async fn vector_search(
    &self,
    query_vector: &[f32],
    limit: usize,
    filter: Option<&str>,
  ) -> Result<Vec<EmbeddingHit>> {
    let table = self.embeddings_table().await?;

    let query = table
      .vector_search(query_vector.to_vec())?
      .distance_type(DistanceType::Cosine)
      .limit(limit);
    let query = if let Some(f) = filter { query.only_if(f) } else { query };

    let results: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut hits = Vec::new();
    for batch in results {
      let chunk_ids = batch
        .column_by_name("chunk_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("column chunk_id".to_string()))?;
      let document_ids = batch
        .column_by_name("document_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("column document_id".to_string()))?;
      let models = batch
        .column_by_name("model")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("column model".to_string()))?;
      let distances = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

      for i in 0..batch.num_rows() {
        let distance = distances.map(|a| a.value(i)).unwrap_or(0.0);
        hits.push(EmbeddingHit {
          chunk_id: chunk_ids.value(i).to_string(),
          document_id: document_ids.value(i).to_string(),
          model: models.value(i).to_string(),
          score: 1.0 - distance.min(1.0),
        });
      }
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
  }

  /// Stored vector for a chunk, if any.
  pub async fn embedding_for_chunk(&self, chunk_id: &str) -> Result<Option<Vec<f32>>> {
    let table = self.embeddings_table().await?;

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("chunk_id = '{}'", escape_sql(chunk_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() == 0 {
        continue;
      }
      let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| DbError::NotFound("column vector".to_string()))?;
      let values = vectors.value(0);
      let floats = values
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| DbError::NotFound("vector items".to_string()))?;
      return Ok(Some(floats.values().to_vec()));
    }
    Ok(None)
  }

  /// Number of embeddings, optionally per document.
  pub async fn count_embeddings(&self, document_id: Option<&str>) -> Result<usize> {
    let table = self.embeddings_table().await?;
    let filter = document_id.map(|id| format!("document_id = '{}'", escape_sql(id)));
    Ok(table.count_rows(filter).await?)
  }
}
