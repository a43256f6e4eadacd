use arrow_array::{Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use foldex_core::{DocumentChunk, ExtractionParams, KeyPhrase};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::connection::{DbError, FolderDb, Result, escape_sql};
use crate::schema::chunks_schema;

impl FolderDb {
  /// Insert chunk rows in one batch. Callers delete prior rows for the
  /// document first; chunk ids are deterministic per (document, index).
  #[tracing::instrument(level = "trace", skip(self, chunks), fields(count = chunks.len()))]
  pub async fn add_chunks(&self, chunks: &[DocumentChunk]) -> Result<()> {
    if chunks.is_empty() {
      return Ok(());
    }

    let table = self.chunks_table().await?;
    let batch = chunks_to_batch(chunks)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// All chunks of a document in ascending chunk_index order.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
    let table = self.chunks_table().await?;

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("document_id = '{}'", escape_sql(document_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, i)?);
      }
    }
    chunks.sort_by_key(|c| c.chunk_index);
    Ok(chunks)
  }

  /// A contiguous chunk range of a document (for neighboring context).
  pub async fn chunks_in_range(&self, document_id: &str, from_index: u32, to_index: u32) -> Result<Vec<DocumentChunk>> {
    let table = self.chunks_table().await?;

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!(
        "document_id = '{}' AND chunk_index >= {from_index} AND chunk_index <= {to_index}",
        escape_sql(document_id)
      ))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, i)?);
      }
    }
    chunks.sort_by_key(|c| c.chunk_index);
    Ok(chunks)
  }

  /// Fetch specific chunks by id.
  pub async fn chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<DocumentChunk>> {
    if chunk_ids.is_empty() {
      return Ok(Vec::new());
    }

    let table = self.chunks_table().await?;
    let id_list = chunk_ids
      .iter()
      .map(|id| format!("'{}'", escape_sql(id)))
      .collect::<Vec<_>>()
      .join(", ");

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("chunk_id IN ({id_list})"))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, i)?);
      }
    }
    Ok(chunks)
  }

  /// Number of chunks for a document.
  pub async fn count_chunks(&self, document_id: Option<&str>) -> Result<usize> {
    let table = self.chunks_table().await?;
    let filter = document_id.map(|id| format!("document_id = '{}'", escape_sql(id)));
    Ok(table.count_rows(filter).await?)
  }
}

fn chunks_to_batch(chunks: &[DocumentChunk]) -> Result<RecordBatch> {
  let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id()).collect();
  let document_ids: Vec<String> = chunks.iter().map(|c| c.document_id.clone()).collect();
  let indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
  let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
  let starts: Vec<u64> = chunks.iter().map(|c| c.start_offset as u64).collect();
  let ends: Vec<u64> = chunks.iter().map(|c| c.end_offset as u64).collect();
  let tokens: Vec<u32> = chunks.iter().map(|c| c.token_count).collect();
  let params: Vec<String> = chunks
    .iter()
    .map(|c| serde_json::to_string(&c.extraction_params))
    .collect::<std::result::Result<_, _>>()?;
  let phrases: Vec<String> = chunks
    .iter()
    .map(|c| serde_json::to_string(&c.key_phrases))
    .collect::<std::result::Result<_, _>>()?;
  let readability: Vec<f32> = chunks.iter().map(|c| c.readability_score).collect();

  let batch = RecordBatch::try_new(
    chunks_schema(),
    vec![
      Arc::new(StringArray::from(chunk_ids)),
      Arc::new(StringArray::from(document_ids)),
      Arc::new(UInt32Array::from(indexes)),
      Arc::new(StringArray::from(contents)),
      Arc::new(UInt64Array::from(starts)),
      Arc::new(UInt64Array::from(ends)),
      Arc::new(UInt32Array::from(tokens)),
      Arc::new(StringArray::from(params)),
      Arc::new(StringArray::from(phrases)),
      Arc::new(Float32Array::from(readability)),
    ],
  )?;

  Ok(batch)
}

pub(crate) fn batch_to_chunk(batch: &RecordBatch, row: usize) -> Result<DocumentChunk> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let get_u32 = |name: &str| -> Result<u32> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let get_u64 = |name: &str| -> Result<u64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let readability = batch
    .column_by_name("readability")
    .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column readability".to_string()))?;

  let extraction_params: ExtractionParams = serde_json::from_str(&get_string("extraction_params")?)?;
  let key_phrases: Vec<KeyPhrase> = serde_json::from_str(&get_string("key_phrases")?)?;

  Ok(DocumentChunk {
    document_id: get_string("document_id")?,
    chunk_index: get_u32("chunk_index")?,
    content: get_string("content")?,
    start_offset: get_u64("start_offset")? as usize,
    end_offset: get_u64("end_offset")? as usize,
    token_count: get_u32("token_count")?,
    extraction_params,
    key_phrases,
    readability_score: readability,
  })
}
