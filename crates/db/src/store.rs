//! Composite store operations binding documents, chunks, embeddings, and
//! file-state into one consistent view.
//!
//! LanceDB appends are atomic per table but there is no cross-table
//! transaction, so the composite write is ordered with the file-state
//! transition last: a crash mid-write leaves the file PROCESSING, startup
//! recovery resets it to PENDING, and the next run's delete-before-insert
//! clears any partial rows. No partially-written document is ever
//! observable as INDEXED.

use foldex_core::{DocumentChunk, DocumentRecord, FileState, FileType, ProcessingState};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::{FolderDb, Result, escape_sql};

/// Options for chunk search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
  pub top_k: usize,
  /// Minimum similarity score; hits below it are dropped.
  pub threshold: f32,
  /// Restrict to documents of one type.
  pub file_type: Option<FileType>,
  /// Restrict to document ids under a path prefix.
  pub path_prefix: Option<String>,
}

impl SearchOptions {
  pub fn new(top_k: usize) -> Self {
    Self {
      top_k,
      threshold: 0.0,
      file_type: None,
      path_prefix: None,
    }
  }
}

/// One ranked search result, hydrated with chunk content and location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
  pub document_id: String,
  pub chunk_id: String,
  pub chunk_index: u32,
  pub content: String,
  pub score: f32,
  /// Human-readable location derived from the chunk's extraction params.
  pub location: String,
  pub extraction_params: foldex_core::ExtractionParams,
  pub key_phrases: Vec<foldex_core::KeyPhrase>,
  pub file_type: FileType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
}

impl FolderDb {
  /// Persist one fully-processed document.
  ///
  /// Replaces any prior chunks and embeddings for the document, upserts
  /// the document row, and records file-state INDEXED with the chunk
  /// count. Only the supplied (chunk, vector) pairs are written, so the
  /// 1:1 chunk ↔ embedding invariant holds.
  #[tracing::instrument(level = "debug", skip(self, record, pairs), fields(document_id = %record.document_id, chunks = pairs.len()))]
  pub async fn write_document(
    &self,
    record: &DocumentRecord,
    pairs: &[(DocumentChunk, Vec<f32>)],
    state: FileState,
  ) -> Result<()> {
    self.remove_chunks_for_document(&record.document_id).await?;

    let chunks: Vec<DocumentChunk> = pairs.iter().map(|(c, _)| c.clone()).collect();
    self.add_chunks(&chunks).await?;

    let embed_pairs: Vec<(&DocumentChunk, Vec<f32>)> =
      pairs.iter().map(|(c, v)| (c, v.clone())).collect();
    self.add_embeddings(&embed_pairs).await?;

    self.upsert_document(record).await?;
    self.record_file_state(state).await;

    debug!(document_id = %record.document_id, "Document written");
    Ok(())
  }

  /// Delete chunks and embeddings for a document, keeping the document
  /// row and file state. Used before re-indexing a modified file so no
  /// duplicate vectors survive.
  pub async fn remove_chunks_for_document(&self, document_id: &str) -> Result<()> {
    let predicate = format!("document_id = '{}'", escape_sql(document_id));
    self.embeddings_table().await?.delete(&predicate).await?;
    self.chunks_table().await?.delete(&predicate).await?;
    Ok(())
  }

  /// Cascade-delete a document: embeddings, chunks, document row, and the
  /// file-state row transitions to DELETED.
  #[tracing::instrument(level = "debug", skip(self))]
  pub async fn remove_document(&self, document_id: &str) -> Result<()> {
    self.remove_chunks_for_document(document_id).await?;

    let predicate = format!("document_id = '{}'", escape_sql(document_id));
    self.documents_table().await?.delete(&predicate).await?;

    if let Some(mut state) = self.get_file_state(document_id).await? {
      state.state = ProcessingState::Deleted;
      state.chunk_count = None;
      self.record_file_state(state).await;
    }

    debug!(document_id, "Document removed");
    Ok(())
  }

  /// Ranked, filtered chunk search.
  ///
  /// Vector search runs over the embeddings table; hits are hydrated from
  /// chunks and documents. When document-level filters apply, the vector
  /// search over-fetches so post-filtering can still fill `top_k`.
  #[tracing::instrument(level = "debug", skip(self, query_vector), fields(top_k = options.top_k))]
  pub async fn search_chunks(&self, query_vector: &[f32], options: &SearchOptions) -> Result<Vec<SearchHit>> {
    let filtered = options.file_type.is_some() || options.path_prefix.is_some();
    let fetch = if filtered { options.top_k * 4 } else { options.top_k };

    let prefix_filter = options
      .path_prefix
      .as_ref()
      .map(|p| format!("document_id LIKE '{}%'", escape_sql(p)));

    let hits = self
      .vector_search(query_vector, fetch.max(1), prefix_filter.as_deref())
      .await?;

    let chunk_ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    let chunks = self.chunks_by_ids(&chunk_ids).await?;

    let mut results = Vec::new();
    for hit in &hits {
      if hit.score < options.threshold {
        continue;
      }
      let Some(chunk) = chunks.iter().find(|c| c.id() == hit.chunk_id) else {
        continue;
      };

      let document = self.get_document(&chunk.document_id).await?;
      let (file_type, title) = match &document {
        Some(d) => (d.file_type, d.metadata.title.clone()),
        None => continue,
      };

      if let Some(wanted) = options.file_type
        && file_type != wanted
      {
        continue;
      }

      results.push(SearchHit {
        document_id: chunk.document_id.clone(),
        chunk_id: hit.chunk_id.clone(),
        chunk_index: chunk.chunk_index,
        content: chunk.content.clone(),
        score: hit.score,
        location: chunk.extraction_params.location(),
        extraction_params: chunk.extraction_params.clone(),
        key_phrases: chunk.key_phrases.clone(),
        file_type,
        title,
      });

      if results.len() >= options.top_k {
        break;
      }
    }

    Ok(results)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunks::tests::chunk;
  use chrono::Utc;
  use foldex_core::DocumentMetadata;
  use tempfile::TempDir;

  fn record(id: &str, file_type: FileType) -> DocumentRecord {
    DocumentRecord {
      document_id: id.to_string(),
      file_type,
      size_bytes: 10,
      created: Utc::now(),
      modified: Utc::now(),
      metadata: DocumentMetadata::default(),
      document_embedding: None,
      document_keywords: None,
      processing_time_ms: 1,
    }
  }

  fn indexed_state(path: &str, hash: &str, chunks: u32) -> FileState {
    FileState::processing(path, hash, 0).mark_success(chunks)
  }

  #[tokio::test]
  async fn test_write_document_full() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    let pairs = vec![
      (chunk("a.md", 0, "alpha"), vec![1.0, 0.0, 0.0, 0.0]),
      (chunk("a.md", 1, "beta"), vec![0.0, 1.0, 0.0, 0.0]),
    ];
    db.write_document(&record("a.md", FileType::Markdown), &pairs, indexed_state("a.md", "h1", 2))
      .await
      .unwrap();

    assert_eq!(db.count_chunks(Some("a.md")).await.unwrap(), 2);
    assert_eq!(db.count_embeddings(Some("a.md")).await.unwrap(), 2);
    assert!(db.get_document("a.md").await.unwrap().is_some());

    let state = db.get_file_state("a.md").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Indexed);
    assert_eq!(state.chunk_count, Some(2));
  }

  #[tokio::test]
  async fn test_rewrite_removes_old_vectors() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    let pairs = vec![
      (chunk("a.md", 0, "old one"), vec![1.0, 0.0, 0.0, 0.0]),
      (chunk("a.md", 1, "old two"), vec![0.0, 1.0, 0.0, 0.0]),
      (chunk("a.md", 2, "old three"), vec![0.0, 0.0, 1.0, 0.0]),
    ];
    db.write_document(&record("a.md", FileType::Markdown), &pairs, indexed_state("a.md", "h1", 3))
      .await
      .unwrap();

    let pairs = vec![(chunk("a.md", 0, "new"), vec![0.5, 0.5, 0.0, 0.0])];
    db.write_document(&record("a.md", FileType::Markdown), &pairs, indexed_state("a.md", "h2", 1))
      .await
      .unwrap();

    // Old embeddings gone, new present, no duplicates
    assert_eq!(db.count_chunks(Some("a.md")).await.unwrap(), 1);
    assert_eq!(db.count_embeddings(Some("a.md")).await.unwrap(), 1);
    let chunks = db.chunks_for_document("a.md").await.unwrap();
    assert_eq!(chunks[0].content, "new");
    let state = db.get_file_state("a.md").await.unwrap().unwrap();
    assert_eq!(state.content_hash, "h2");
  }

  #[tokio::test]
  async fn test_remove_document_cascades() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    let pairs = vec![(chunk("a.md", 0, "x"), vec![1.0, 0.0, 0.0, 0.0])];
    db.write_document(&record("a.md", FileType::Markdown), &pairs, indexed_state("a.md", "h1", 1))
      .await
      .unwrap();

    db.remove_document("a.md").await.unwrap();

    assert_eq!(db.count_chunks(Some("a.md")).await.unwrap(), 0);
    assert_eq!(db.count_embeddings(Some("a.md")).await.unwrap(), 0);
    assert!(db.get_document("a.md").await.unwrap().is_none());
    let state = db.get_file_state("a.md").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Deleted);
  }

  #[tokio::test]
  async fn test_search_with_threshold_and_type_filter() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    db.write_document(
      &record("a.md", FileType::Markdown),
      &[(chunk("a.md", 0, "markdown chunk"), vec![1.0, 0.0, 0.0, 0.0])],
      indexed_state("a.md", "h1", 1),
    )
    .await
    .unwrap();
    db.write_document(
      &record("b.txt", FileType::Text),
      &[(chunk("b.txt", 0, "text chunk"), vec![0.9, 0.1, 0.0, 0.0])],
      indexed_state("b.txt", "h2", 1),
    )
    .await
    .unwrap();

    let mut options = SearchOptions::new(10);
    options.file_type = Some(FileType::Text);
    let hits = db.search_chunks(&[1.0, 0.0, 0.0, 0.0], &options).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "b.txt");

    let mut options = SearchOptions::new(10);
    options.threshold = 0.999;
    let hits = db.search_chunks(&[1.0, 0.0, 0.0, 0.0], &options).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "a.md");
  }

  #[tokio::test]
  async fn test_search_path_prefix() {
    let temp = TempDir::new().unwrap();
    let db = FolderDb::open(temp.path(), 4, "cpu:test").await.unwrap();

    db.write_document(
      &record("reports/q1.md", FileType::Markdown),
      &[(chunk("reports/q1.md", 0, "report"), vec![1.0, 0.0, 0.0, 0.0])],
      indexed_state("reports/q1.md", "h1", 1),
    )
    .await
    .unwrap();
    db.write_document(
      &record("notes/n.md", FileType::Markdown),
      &[(chunk("notes/n.md", 0, "note"), vec![1.0, 0.0, 0.0, 0.0])],
      indexed_state("notes/n.md", "h2", 1),
    )
    .await
    .unwrap();

    let mut options = SearchOptions::new(10);
    options.path_prefix = Some("reports/".to_string());
    let hits = db.search_chunks(&[1.0, 0.0, 0.0, 0.0], &options).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "reports/q1.md");
  }
}
