use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use chrono::{TimeZone, Utc};
use foldex_core::{DocumentMetadata, DocumentRecord, FileType, KeyPhrase};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::connection::{DbError, FolderDb, Result, escape_sql};
use crate::schema::documents_schema;

impl FolderDb {
  /// Insert or replace a document row.
  #[tracing::instrument(level = "trace", skip(self, record), fields(document_id = %record.document_id))]
  pub async fn upsert_document(&self, record: &DocumentRecord) -> Result<()> {
    let table = self.documents_table().await?;

    let _ = table
      .delete(&format!("document_id = '{}'", escape_sql(&record.document_id)))
      .await;

    let batch = document_to_batch(record)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], documents_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Get a document row by id.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
    let table = self.documents_table().await?;

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("document_id = '{}'", escape_sql(document_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() > 0 {
        return Ok(Some(batch_to_document(batch, 0)?));
      }
    }
    Ok(None)
  }

  /// List document rows, optionally filtered.
  pub async fn list_documents(&self, filter: Option<&str>, limit: Option<usize>) -> Result<Vec<DocumentRecord>> {
    let table = self.documents_table().await?;

    let query = match (filter, limit) {
      (Some(f), Some(l)) => table.query().only_if(f).limit(l),
      (Some(f), None) => table.query().only_if(f),
      (None, Some(l)) => table.query().limit(l),
      (None, None) => table.query(),
    };

    let results: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut documents = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        documents.push(batch_to_document(&batch, i)?);
      }
    }
    documents.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(documents)
  }

  /// Number of documents in the store.
  pub async fn count_documents(&self) -> Result<usize> {
    let table = self.documents_table().await?;
    Ok(table.count_rows(None).await?)
  }
}

fn document_to_batch(record: &DocumentRecord) -> Result<RecordBatch> {
  let document_embedding = match &record.document_embedding {
    Some(v) => Some(serde_json::to_string(v)?),
    None => None,
  };
  let document_keywords = match &record.document_keywords {
    Some(k) => Some(serde_json::to_string(k)?),
    None => None,
  };

  let batch = RecordBatch::try_new(
    documents_schema(),
    vec![
      Arc::new(StringArray::from(vec![record.document_id.clone()])),
      Arc::new(StringArray::from(vec![record.file_type.as_str().to_string()])),
      Arc::new(UInt64Array::from(vec![record.size_bytes])),
      Arc::new(Int64Array::from(vec![record.created.timestamp_millis()])),
      Arc::new(Int64Array::from(vec![record.modified.timestamp_millis()])),
      Arc::new(StringArray::from(vec![record.metadata.title.clone()])),
      Arc::new(StringArray::from(vec![record.metadata.author.clone()])),
      Arc::new(UInt32Array::from(vec![record.metadata.page_count])),
      Arc::new(UInt32Array::from(vec![record.metadata.slide_count])),
      Arc::new(UInt32Array::from(vec![record.metadata.sheet_count])),
      Arc::new(UInt32Array::from(vec![record.metadata.paragraph_count])),
      Arc::new(StringArray::from(vec![document_embedding])),
      Arc::new(StringArray::from(vec![document_keywords])),
      Arc::new(UInt64Array::from(vec![record.processing_time_ms])),
    ],
  )?;

  Ok(batch)
}

pub(crate) fn batch_to_document(batch: &RecordBatch, row: usize) -> Result<DocumentRecord> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let get_opt_string = |name: &str| -> Option<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row).to_string()) })
  };

  let get_opt_u32 = |name: &str| -> Option<u32> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) })
  };

  let get_u64 = |name: &str| -> Result<u64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let get_i64 = |name: &str| -> Result<i64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let file_type: FileType = get_string("file_type")?
    .parse()
    .map_err(DbError::NotFound)?;

  let document_embedding: Option<Vec<f32>> = match get_opt_string("document_embedding") {
    Some(raw) => Some(serde_json::from_str(&raw)?),
    None => None,
  };
  let document_keywords: Option<Vec<KeyPhrase>> = match get_opt_string("document_keywords") {
    Some(raw) => Some(serde_json::from_str(&raw)?),
    None => None,
  };

  Ok(DocumentRecord {
    document_id: get_string("document_id")?,
    file_type,
    size_bytes: get_u64("size_bytes")?,
    created: Utc
      .timestamp_millis_opt(get_i64("created_at")?)
      .single()
      .unwrap_or_else(Utc::now),
    modified: Utc
      .timestamp_millis_opt(get_i64("modified_at")?)
      .single()
      .unwrap_or_else(Utc::now),
    metadata: DocumentMetadata {
      title: get_opt_string("title"),
      author: get_opt_string("author"),
      page_count: get_opt_u32("page_count"),
      slide_count: get_opt_u32("slide_count"),
      sheet_count: get_opt_u32("sheet_count"),
      paragraph_count: get_opt_u32("paragraph_count"),
    },
    document_embedding,
    document_keywords,
    processing_time_ms: get_u64("processing_time_ms")?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn record(id: &str) -> DocumentRecord {
    DocumentRecord {
      document_id: id.to_string(),
      file_type: FileType::Markdown,
      size_bytes: 42,
      created: Utc::now(),
      modified: Utc::now(),
      metadata: DocumentMetadata {
        title: Some("Title".to_string()),
        paragraph_count: Some(3),
        ..Default::default()
      },
      document_embedding: Some(vec![0.1, 0.2]),
      document_keywords: Some(vec![KeyPhrase {
        text: "keyword".to_string(),
        score: 0.8,
      }]),
      processing_time_ms: 12,
    }
  }

  #[tokio::test]
  async fn test_upsert_and_get_document() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    db.upsert_document(&record("docs/a.md")).await.unwrap();

    let loaded = db.get_document("docs/a.md").await.unwrap().unwrap();
    assert_eq!(loaded.document_id, "docs/a.md");
    assert_eq!(loaded.file_type, FileType::Markdown);
    assert_eq!(loaded.metadata.title.as_deref(), Some("Title"));
    assert_eq!(loaded.metadata.paragraph_count, Some(3));
    assert_eq!(loaded.document_embedding, Some(vec![0.1, 0.2]));
    assert_eq!(loaded.document_keywords.unwrap()[0].text, "keyword");
  }

  #[tokio::test]
  async fn test_upsert_replaces() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    db.upsert_document(&record("a.md")).await.unwrap();
    let mut updated = record("a.md");
    updated.size_bytes = 99;
    db.upsert_document(&updated).await.unwrap();

    assert_eq!(db.count_documents().await.unwrap(), 1);
    assert_eq!(db.get_document("a.md").await.unwrap().unwrap().size_bytes, 99);
  }

  #[tokio::test]
  async fn test_get_missing_document() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();
    assert!(db.get_document("missing.md").await.unwrap().is_none());
  }
}
