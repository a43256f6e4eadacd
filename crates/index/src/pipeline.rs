//! Per-file indexing pipeline: parse → chunk → semantic extract → embed
//! → aggregate → persist.
//!
//! Files in a folder job are processed sequentially; inside one file,
//! embedding and keyphrase calls run in contiguous batches. Cancellation
//! is cooperative and checked between files, between batches, and before
//! the persist step; an interrupted file stays PROCESSING and startup
//! recovery resets it to PENDING.

use db::FolderDb;
use embedding::{EmbeddingBackend, EmbeddingError};
use extract::{
  CHUNK_MMR_LAMBDA, DOCUMENT_MMR_LAMBDA, IncrementalMean, MAX_DOCUMENT_KEYWORDS, MIN_DOCUMENT_KEYWORD_SCORE,
  NgramRange, coleman_liau, fallback_keyphrases, generate_candidates, select_document_keywords, select_keyphrases,
};
use foldex_core::{
  ChangeSet, DocumentChunk, DocumentRecord, EmbeddingConfig, FileFingerprint, FileState, IndexConfig, KeyPhrase,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{ChunkerConfig, chunk_document};
use crate::parser::{self, ParseError};
use crate::state::decide;

/// Candidates per chunk offered to the n-gram strategy.
const MAX_CANDIDATES_PER_CHUNK: usize = 40;
/// Candidate pool cap for document-level keywords.
const MAX_DOCUMENT_CANDIDATES: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("Parse error: {0}")]
  Parse(#[from] ParseError),
  #[error("Database error: {0}")]
  Database(#[from] db::DbError),
  #[error("Embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Cancelled")]
  Cancelled,
}

/// Pipeline configuration, assembled from the index and embedding config
/// sections plus any per-folder overrides.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub batch_size: usize,
  pub context_window: usize,
  pub overlap_fraction: f32,
  pub keyphrase_top_k: usize,
  pub max_retries: u32,
  pub retry_base_ms: u64,
}

impl PipelineConfig {
  pub fn from_configs(index: &IndexConfig, embedding: &EmbeddingConfig, batch_override: Option<usize>) -> Self {
    Self {
      batch_size: batch_override.unwrap_or(index.batch_size).max(1),
      context_window: embedding.context_window,
      overlap_fraction: index.overlap_fraction,
      keyphrase_top_k: index.keyphrase_top_k,
      max_retries: index.max_retries,
      retry_base_ms: index.retry_base_ms,
    }
  }
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self::from_configs(&IndexConfig::default(), &EmbeddingConfig::default(), None)
  }
}

/// Progress snapshot reported at stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct IndexProgress {
  pub total_files: usize,
  pub processed_files: usize,
  pub total_chunks: usize,
  pub processed_chunks: usize,
  pub current_file: Option<String>,
  /// Per-file piecewise percentage (see [`stage_percent`]).
  pub percent: u8,
}

/// Pipeline stage boundaries for progress mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Embedded,
  Keyphrased,
  Persisted,
}

/// Piecewise per-file progress.
///
/// Keyphrases-first back-ends (co-resident keyphrase API) reach 40%
/// after keyphrases and 100% after embedding; embeddings-first back-ends
/// reach 50% after embedding, 80% after keyphrases, 100% after persist.
pub fn stage_percent(keyphrases_first: bool, stage: Stage) -> u8 {
  match (keyphrases_first, stage) {
    (true, Stage::Keyphrased) => 40,
    (true, Stage::Embedded) => 100,
    (true, Stage::Persisted) => 100,
    (false, Stage::Embedded) => 50,
    (false, Stage::Keyphrased) => 80,
    (false, Stage::Persisted) => 100,
  }
}

/// What happened to one file.
#[derive(Debug, Clone)]
pub enum FileOutcome {
  Indexed { chunks: usize, partial: bool },
  Skipped { reason: String },
  Ignored { reason: String },
  Failed { error: String },
}

/// Aggregate result of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineStats {
  pub files_processed: usize,
  pub files_skipped: usize,
  pub files_failed: usize,
  pub chunks_written: usize,
  pub embeddings_written: usize,
  pub errors: Vec<String>,
}

/// Drives one folder's files through the pipeline against that folder's
/// own store. Document writes never go through a shared store.
pub struct FilePipeline {
  db: Arc<FolderDb>,
  backend: Arc<dyn EmbeddingBackend>,
  config: PipelineConfig,
  cancel: CancellationToken,
  throttled: Arc<AtomicBool>,
  progress: Option<mpsc::Sender<IndexProgress>>,
}

impl FilePipeline {
  pub fn new(
    db: Arc<FolderDb>,
    backend: Arc<dyn EmbeddingBackend>,
    config: PipelineConfig,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      db,
      backend,
      config,
      cancel,
      throttled: Arc::new(AtomicBool::new(false)),
      progress: None,
    }
  }

  pub fn with_progress(mut self, tx: mpsc::Sender<IndexProgress>) -> Self {
    self.progress = Some(tx);
    self
  }

  /// Shared flag set by the resource manager; while raised, batches
  /// shrink to ease memory pressure.
  pub fn with_throttle(mut self, flag: Arc<AtomicBool>) -> Self {
    self.throttled = flag;
    self
  }

  fn effective_batch_size(&self) -> usize {
    if self.throttled.load(Ordering::Relaxed) {
      (self.config.batch_size / 2).max(1)
    } else {
      self.config.batch_size
    }
  }

  fn check_cancelled(&self) -> Result<(), PipelineError> {
    if self.cancel.is_cancelled() {
      Err(PipelineError::Cancelled)
    } else {
      Ok(())
    }
  }

  async fn report(&self, progress: IndexProgress) {
    if let Some(tx) = &self.progress {
      let _ = tx.send(progress).await;
    }
  }

  /// Apply a change set: cascade deletions, clear modified documents'
  /// vectors, then run new ∪ modified through the pipeline. Finishes
  /// with a checkpoint so file state survives restart.
  #[tracing::instrument(level = "info", skip(self, changeset), fields(folder = %root.display()))]
  pub async fn index_changes(&self, root: &Path, changeset: &ChangeSet) -> Result<PipelineStats, PipelineError> {
    let mut stats = PipelineStats::default();

    for path in &changeset.deleted {
      self.check_cancelled()?;
      debug!(file = %path, "Removing deleted document");
      self.db.remove_document(path).await?;
    }

    // Clear modified documents before re-indexing so no duplicate
    // vectors can survive a crash between stages.
    for fp in &changeset.modified {
      self.check_cancelled()?;
      self.db.remove_chunks_for_document(&fp.relative_path).await?;
    }

    let files: Vec<&FileFingerprint> = changeset.to_process().collect();
    let total_files = files.len();

    for (i, fp) in files.iter().enumerate() {
      self.check_cancelled()?;

      let outcome = self.process_file(root, fp).await?;
      match &outcome {
        FileOutcome::Indexed { chunks, partial } => {
          stats.files_processed += 1;
          stats.chunks_written += chunks;
          stats.embeddings_written += chunks;
          if *partial {
            stats.errors.push(format!("{}: partial embedding batch", fp.relative_path));
          }
        }
        FileOutcome::Skipped { .. } | FileOutcome::Ignored { .. } => stats.files_skipped += 1,
        FileOutcome::Failed { error } => {
          stats.files_failed += 1;
          stats.errors.push(format!("{}: {error}", fp.relative_path));
        }
      }

      self
        .report(IndexProgress {
          total_files,
          processed_files: i + 1,
          total_chunks: stats.chunks_written,
          processed_chunks: stats.chunks_written,
          current_file: Some(fp.relative_path.clone()),
          percent: 100,
        })
        .await;
    }

    self.db.checkpoint().await?;

    info!(
      processed = stats.files_processed,
      skipped = stats.files_skipped,
      failed = stats.files_failed,
      chunks = stats.chunks_written,
      "Pipeline run complete"
    );
    Ok(stats)
  }

  /// Process one file, consulting and recording file state. Per-file
  /// errors are captured in the outcome; only cancellation propagates.
  pub async fn process_file(&self, root: &Path, fp: &FileFingerprint) -> Result<FileOutcome, PipelineError> {
    // Errors reading state fail safe to processing
    let existing = self.db.get_file_state(&fp.relative_path).await.unwrap_or_default();
    let decision = decide(existing.as_ref(), &fp.content_hash, self.config.max_retries);

    if !decision.should_process() {
      debug!(file = %fp.relative_path, reason = decision.reason, "Skipping file");
      return Ok(match decision.reason {
        "corrupted" | "retries exhausted" => FileOutcome::Ignored {
          reason: decision.reason.to_string(),
        },
        _ => FileOutcome::Skipped {
          reason: decision.reason.to_string(),
        },
      });
    }

    let mut attempt = existing.map(|s| s.attempt_count).unwrap_or(0);

    loop {
      self.check_cancelled()?;
      self
        .db
        .record_file_state(FileState::processing(&fp.relative_path, &fp.content_hash, attempt))
        .await;

      match self.process_once(root, fp, attempt).await {
        Ok(outcome) => return Ok(outcome),
        Err(PipelineError::Cancelled) => {
          // Leave the row PROCESSING; startup recovery resets it
          return Err(PipelineError::Cancelled);
        }
        Err(e) => {
          let corrupted = matches!(&e, PipelineError::Parse(pe) if pe.is_corrupted());
          let failed = FileState::processing(&fp.relative_path, &fp.content_hash, attempt)
            .mark_failure(&e.to_string(), corrupted);
          attempt = failed.attempt_count;
          self.db.record_file_state(failed).await;

          if corrupted || attempt >= self.config.max_retries {
            warn!(file = %fp.relative_path, error = %e, "File failed permanently");
            return Ok(FileOutcome::Failed { error: e.to_string() });
          }

          let backoff = Duration::from_millis(self.config.retry_base_ms << (attempt.saturating_sub(1)));
          warn!(file = %fp.relative_path, error = %e, ?backoff, "File failed, retrying");
          tokio::select! {
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
          }
        }
      }
    }
  }

  async fn process_once(&self, root: &Path, fp: &FileFingerprint, attempt: u32) -> Result<FileOutcome, PipelineError> {
    let started = Instant::now();
    let path = root.join(&fp.relative_path);

    let file_type = parser::file_type_for(&path)?;
    let parsed = parser::parse_file(&path, file_type).await?;

    let chunker_config = ChunkerConfig {
      context_window: self.config.context_window,
      overlap_fraction: self.config.overlap_fraction,
    };
    let mut chunks = chunk_document(&parsed, &fp.relative_path, &chunker_config);

    if chunks.is_empty() {
      let state = FileState::processing(&fp.relative_path, &fp.content_hash, attempt).mark_skipped("no content");
      self.db.record_file_state(state).await;
      return Ok(FileOutcome::Skipped {
        reason: "no content".to_string(),
      });
    }

    for chunk in &mut chunks {
      chunk.readability_score = coleman_liau(&chunk.content);
    }

    let keyphrases_first = self.backend.capabilities().can_extract_keyphrases;
    let hints = parsed.structural_hints();
    let total_chunks = chunks.len();

    let vectors: Vec<Option<Vec<f32>>>;
    if keyphrases_first {
      // Co-resident model strategy: the back-end's own keyphrase API
      // runs on raw chunk text, then chunks are embedded.
      self.keyphrases_from_backend(&mut chunks).await;
      self.report_stage(fp, total_chunks, keyphrases_first, Stage::Keyphrased).await;

      vectors = self.embed_chunks(&chunks).await?;
      self.report_stage(fp, total_chunks, keyphrases_first, Stage::Embedded).await;
    } else {
      // N-gram + cosine strategy: embed chunks once, reuse the vectors
      // for candidate scoring and for storage.
      vectors = self.embed_chunks(&chunks).await?;
      self.report_stage(fp, total_chunks, keyphrases_first, Stage::Embedded).await;

      self.keyphrases_from_ngrams(&mut chunks, &vectors, &hints).await;
      self.report_stage(fp, total_chunks, keyphrases_first, Stage::Keyphrased).await;
    }

    // The fallback generator guarantees no stored chunk has zero phrases
    for chunk in &mut chunks {
      if chunk.key_phrases.is_empty() {
        chunk.key_phrases = fallback_keyphrases(&chunk.content, self.config.keyphrase_top_k);
      }
    }

    let pairs: Vec<(DocumentChunk, Vec<f32>)> = chunks
      .iter()
      .zip(vectors.iter())
      .filter_map(|(chunk, vector)| vector.as_ref().map(|v| (chunk.clone(), v.clone())))
      .collect();
    let complete = pairs.len() == chunks.len();

    // Document-level aggregation is enhancement, not critical
    let (document_embedding, document_keywords) = self.aggregate_document(&pairs).await;

    let record = DocumentRecord {
      document_id: fp.relative_path.clone(),
      file_type,
      size_bytes: fp.size_bytes,
      created: fp.modified,
      modified: fp.modified,
      metadata: parsed.metadata.clone(),
      document_embedding,
      document_keywords,
      processing_time_ms: started.elapsed().as_millis() as u64,
    };

    let state = if complete {
      FileState::processing(&fp.relative_path, &fp.content_hash, attempt).mark_success(pairs.len() as u32)
    } else {
      // Partial batches persist the successful subset but leave the
      // file eligible for retry
      FileState::processing(&fp.relative_path, &fp.content_hash, attempt)
        .mark_failure("partial embedding batch", false)
    };

    self.check_cancelled()?;
    self.db.write_document(&record, &pairs, state).await?;
    self.report_stage(fp, total_chunks, keyphrases_first, Stage::Persisted).await;

    debug!(
      file = %fp.relative_path,
      chunks = pairs.len(),
      total = total_chunks,
      complete,
      "File processed"
    );

    Ok(FileOutcome::Indexed {
      chunks: pairs.len(),
      partial: !complete,
    })
  }

  /// Embed chunk contents in contiguous batches. A failed batch yields
  /// `None` for its positions and processing continues with the next
  /// batch; non-batch errors (uninitialized back-end) propagate.
  async fn embed_chunks(&self, chunks: &[DocumentChunk]) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
    let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());

    for batch in texts.chunks(self.effective_batch_size()) {
      self.check_cancelled()?;

      match self.backend.embed_batch(batch).await {
        Ok(results) => {
          let mut got: Vec<Option<Vec<f32>>> = results.into_iter().map(|r| r.map(|e| e.vector)).collect();
          // Positional alignment even if the back-end returned short
          got.resize(batch.len(), None);
          vectors.extend(got);
        }
        Err(e) if is_batch_level(&e) => {
          warn!(error = %e, batch = batch.len(), "Embedding batch failed, continuing");
          vectors.extend(std::iter::repeat_with(|| None).take(batch.len()));
        }
        Err(e) => return Err(e.into()),
      }
    }

    vectors.resize(texts.len(), None);
    Ok(vectors)
  }

  /// Keyphrases via the back-end's co-resident API. Failures are
  /// non-fatal; affected chunks fall through to the fallback generator.
  async fn keyphrases_from_backend(&self, chunks: &mut [DocumentChunk]) {
    let top_k = self.config.keyphrase_top_k;
    let batch_size = self.effective_batch_size();

    let mut offset = 0;
    while offset < chunks.len() {
      if self.cancel.is_cancelled() {
        return;
      }
      let end = (offset + batch_size).min(chunks.len());
      let texts: Vec<&str> = chunks[offset..end].iter().map(|c| c.content.as_str()).collect();

      match self.backend.extract_keyphrases(&texts, top_k).await {
        Ok(results) => {
          for (chunk, phrases) in chunks[offset..end].iter_mut().zip(results) {
            chunk.key_phrases = phrases;
          }
        }
        Err(e) => {
          warn!(error = %e, "Keyphrase batch failed, falling back");
        }
      }
      offset = end;
    }
  }

  /// N-gram + cosine strategy: generate candidates, embed them, score
  /// against each chunk's own embedding, select with MMR.
  async fn keyphrases_from_ngrams(
    &self,
    chunks: &mut [DocumentChunk],
    vectors: &[Option<Vec<f32>>],
    hints: &[String],
  ) {
    let range = NgramRange::default();
    let top_k = self.config.keyphrase_top_k;

    for (chunk, vector) in chunks.iter_mut().zip(vectors.iter()) {
      if self.cancel.is_cancelled() {
        return;
      }
      let Some(chunk_vector) = vector else { continue };

      let mut candidates = generate_candidates(&chunk.content, range);
      candidates.truncate(MAX_CANDIDATES_PER_CHUNK);
      if candidates.is_empty() {
        continue;
      }

      let refs: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
      let candidate_vectors = match self.backend.embed_batch(&refs).await {
        Ok(results) => results,
        Err(e) => {
          warn!(error = %e, "Candidate embedding failed, falling back");
          continue;
        }
      };

      let mut kept_texts = Vec::new();
      let mut kept_vectors = Vec::new();
      for (candidate, embedded) in candidates.into_iter().zip(candidate_vectors) {
        if let Some(e) = embedded {
          kept_texts.push(candidate);
          kept_vectors.push(e.vector);
        }
      }

      chunk.key_phrases = select_keyphrases(&kept_texts, &kept_vectors, chunk_vector, hints, CHUNK_MMR_LAMBDA, top_k);
    }
  }

  /// Document embedding (incremental mean) plus document keywords
  /// selected from the pooled chunk phrases. Failures are logged and
  /// swallowed.
  async fn aggregate_document(
    &self,
    pairs: &[(DocumentChunk, Vec<f32>)],
  ) -> (Option<Vec<f32>>, Option<Vec<KeyPhrase>>) {
    if pairs.is_empty() {
      return (None, None);
    }

    let mut mean = IncrementalMean::new();
    for (_, vector) in pairs {
      mean.add(vector);
    }
    let Some(document_embedding) = mean.mean() else {
      return (None, None);
    };

    let mut pool: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (chunk, _) in pairs {
      for phrase in &chunk.key_phrases {
        if seen.insert(phrase.text.clone()) {
          pool.push(phrase.text.clone());
        }
      }
    }
    pool.truncate(MAX_DOCUMENT_CANDIDATES);

    if pool.is_empty() {
      return (Some(document_embedding), None);
    }

    let refs: Vec<&str> = pool.iter().map(|s| s.as_str()).collect();
    let mut pool_vectors: Vec<Vec<f32>> = Vec::with_capacity(pool.len());
    let mut kept: Vec<String> = Vec::with_capacity(pool.len());

    let batch_size = self.effective_batch_size();
    for batch_start in (0..refs.len()).step_by(batch_size) {
      let batch_end = (batch_start + batch_size).min(refs.len());
      match self.backend.embed_batch(&refs[batch_start..batch_end]).await {
        Ok(results) => {
          for (text, result) in pool[batch_start..batch_end].iter().zip(results) {
            if let Some(e) = result {
              kept.push(text.clone());
              pool_vectors.push(e.vector);
            }
          }
        }
        Err(e) => {
          warn!(error = %e, "Document keyword embedding failed, skipping keywords");
          return (Some(document_embedding), None);
        }
      }
    }

    let keywords = select_document_keywords(
      &kept,
      &pool_vectors,
      &document_embedding,
      MAX_DOCUMENT_KEYWORDS,
      MIN_DOCUMENT_KEYWORD_SCORE,
      DOCUMENT_MMR_LAMBDA,
    );

    let keywords = if keywords.is_empty() { None } else { Some(keywords) };
    (Some(document_embedding), keywords)
  }

  async fn report_stage(&self, fp: &FileFingerprint, total_chunks: usize, keyphrases_first: bool, stage: Stage) {
    self
      .report(IndexProgress {
        total_files: 0,
        processed_files: 0,
        total_chunks,
        processed_chunks: total_chunks,
        current_file: Some(fp.relative_path.clone()),
        percent: stage_percent(keyphrases_first, stage),
      })
      .await;
  }
}

/// Batch-level failures keep the file alive with partial progress;
/// everything else is a file-level error.
fn is_batch_level(error: &EmbeddingError) -> bool {
  matches!(
    error,
    EmbeddingError::Timeout | EmbeddingError::Network(_) | EmbeddingError::Backend(_) | EmbeddingError::Request(_)
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use embedding::LocalTensorBackend;
  use foldex_core::{DEFAULT_EXCLUDES, ProcessingState};
  use tempfile::TempDir;

  use crate::change::detect_changes;

  fn excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
  }

  async fn setup(dir: &TempDir) -> (Arc<FolderDb>, Arc<dyn EmbeddingBackend>) {
    let backend = LocalTensorBackend::new("cpu:all-minilm-l6-v2", "all-minilm-l6-v2")
      .with_cache_dir(dir.path().join("model-cache"));
    backend.initialize().await.unwrap();
    let backend: Arc<dyn EmbeddingBackend> = Arc::new(backend);

    let db = Arc::new(
      FolderDb::open(dir.path(), backend.dimensions(), backend.model_id())
        .await
        .unwrap(),
    );
    (db, backend)
  }

  fn pipeline(db: Arc<FolderDb>, backend: Arc<dyn EmbeddingBackend>) -> FilePipeline {
    FilePipeline::new(db, backend, PipelineConfig::default(), CancellationToken::new())
  }

  #[test]
  fn test_stage_percent_piecewise() {
    assert_eq!(stage_percent(false, Stage::Embedded), 50);
    assert_eq!(stage_percent(false, Stage::Keyphrased), 80);
    assert_eq!(stage_percent(false, Stage::Persisted), 100);
    assert_eq!(stage_percent(true, Stage::Keyphrased), 40);
    assert_eq!(stage_percent(true, Stage::Embedded), 100);
  }

  #[tokio::test]
  async fn test_index_folder_end_to_end() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
      dir.path().join("report.md"),
      "# Quarterly Report\n\nRevenue grew twelve percent over the quarter. Cloud sales led the growth.",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "Remember to water the plants every tuesday.").unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    assert_eq!(changes.new.len(), 2);

    let stats = pipe.index_changes(dir.path(), &changes).await.unwrap();
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.files_failed, 0);
    assert!(stats.chunks_written >= 2);

    // chunk ↔ embedding invariant
    for doc in ["report.md", "notes.txt"] {
      let chunks = db.count_chunks(Some(doc)).await.unwrap();
      let embeddings = db.count_embeddings(Some(doc)).await.unwrap();
      assert_eq!(chunks, embeddings);
      assert!(chunks >= 1);

      let state = db.get_file_state(doc).await.unwrap().unwrap();
      assert_eq!(state.state, ProcessingState::Indexed);
      assert_eq!(state.chunk_count, Some(chunks as u32));

      // Every stored chunk has phrases and dense indices
      let rows = db.chunks_for_document(doc).await.unwrap();
      for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.chunk_index, i as u32);
        assert!(!row.key_phrases.is_empty());
      }
    }

    let record = db.get_document("report.md").await.unwrap().unwrap();
    assert!(record.document_embedding.is_some());
    assert_eq!(record.metadata.title.as_deref(), Some("Quarterly Report"));
  }

  #[tokio::test]
  async fn test_second_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.md"), "# A\n\nSome stable content here.").unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    pipe.index_changes(dir.path(), &changes).await.unwrap();

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    assert!(changes.is_empty());
    let stats = pipe.index_changes(dir.path(), &changes).await.unwrap();
    assert_eq!(stats.files_processed, 0);
    assert_eq!(stats.files_failed, 0);
  }

  #[tokio::test]
  async fn test_modified_file_replaces_vectors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    std::fs::write(&path, "# A\n\nOriginal content about databases.").unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    pipe.index_changes(dir.path(), &changes).await.unwrap();
    let old_hash = db.get_file_state("a.md").await.unwrap().unwrap().content_hash;

    std::fs::write(&path, "# A\n\nRewritten content about embeddings and vectors.").unwrap();
    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    assert_eq!(changes.modified.len(), 1);
    pipe.index_changes(dir.path(), &changes).await.unwrap();

    let state = db.get_file_state("a.md").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Indexed);
    assert_ne!(state.content_hash, old_hash);

    let chunks = db.chunks_for_document("a.md").await.unwrap();
    assert_eq!(chunks.len(), db.count_embeddings(Some("a.md")).await.unwrap());
    assert!(chunks.iter().all(|c| c.content.contains("Rewritten") || c.content.contains("embeddings")));
  }

  #[tokio::test]
  async fn test_deleted_file_cascades() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.md");
    std::fs::write(&path, "# A\n\nSoon to be deleted.").unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    pipe.index_changes(dir.path(), &changes).await.unwrap();

    std::fs::remove_file(&path).unwrap();
    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    assert_eq!(changes.deleted, vec!["a.md".to_string()]);
    pipe.index_changes(dir.path(), &changes).await.unwrap();

    assert_eq!(db.count_chunks(Some("a.md")).await.unwrap(), 0);
    assert_eq!(db.count_embeddings(Some("a.md")).await.unwrap(), 0);
    assert!(db.get_document("a.md").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_unsupported_content_fails_corrupted() {
    let dir = TempDir::new().unwrap();
    // .pdf extension but not a pdf: parse fails as corrupted
    std::fs::write(dir.path().join("fake.pdf"), "this is not a pdf").unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    let stats = pipe.index_changes(dir.path(), &changes).await.unwrap();
    assert_eq!(stats.files_failed, 1);

    let state = db.get_file_state("fake.pdf").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Failed);
    assert!(state.corrupted);

    // Next run ignores it rather than retrying
    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    let stats = pipe.index_changes(dir.path(), &changes).await.unwrap();
    assert_eq!(stats.files_failed, 0);
    assert_eq!(stats.files_processed, 0);
  }

  #[tokio::test]
  async fn test_cancellation_stops_between_files() {
    let dir = TempDir::new().unwrap();
    for i in 0..3 {
      std::fs::write(dir.path().join(format!("f{i}.txt")), format!("file number {i}")).unwrap();
    }

    let (db, backend) = setup(&dir).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipe = FilePipeline::new(db.clone(), backend, PipelineConfig::default(), cancel);

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    let result = pipe.index_changes(dir.path(), &changes).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));

    // Nothing was committed
    assert_eq!(db.count_documents().await.unwrap(), 0);
  }

  mod mock_backends {
    use super::*;
    use async_trait::async_trait;
    use embedding::{Capabilities, EmbeddingError, EmbeddingVector, Lifecycle, ServiceKind};
    use std::sync::atomic::AtomicUsize;

    /// Deterministic stand-in for a keyphrase-capable worker: records
    /// how each API is used so strategy selection is observable.
    pub struct KeyphraseCapable {
      pub embed_calls: AtomicUsize,
      pub keyphrase_calls: AtomicUsize,
    }

    impl KeyphraseCapable {
      pub fn new() -> Self {
        Self {
          embed_calls: AtomicUsize::new(0),
          keyphrase_calls: AtomicUsize::new(0),
        }
      }
    }

    #[async_trait]
    impl embedding::EmbeddingBackend for KeyphraseCapable {
      fn model_id(&self) -> &str {
        "gpu:mock"
      }

      fn dimensions(&self) -> usize {
        4
      }

      fn capabilities(&self) -> Capabilities {
        Capabilities {
          can_embed: true,
          can_extract_keyphrases: true,
          service_kind: ServiceKind::RemoteWorker,
        }
      }

      fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Ready
      }

      async fn initialize(&self) -> Result<(), EmbeddingError> {
        Ok(())
      }

      async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        Ok(
          texts
            .iter()
            .map(|t| Some(EmbeddingVector::new(vec![t.len() as f32, 1.0, 0.0, 0.0], "gpu:mock")))
            .collect(),
        )
      }

      async fn extract_keyphrases(
        &self,
        texts: &[&str],
        top_k: usize,
      ) -> Result<Vec<Vec<KeyPhrase>>, EmbeddingError> {
        self.keyphrase_calls.fetch_add(1, Ordering::Relaxed);
        Ok(
          texts
            .iter()
            .map(|_| {
              (0..top_k.min(2))
                .map(|i| KeyPhrase {
                  text: format!("worker phrase {i}"),
                  score: 0.9 - i as f32 * 0.1,
                })
                .collect()
            })
            .collect(),
        )
      }
    }

    /// Fails exactly the second embed_batch call with a timeout.
    pub struct Flaky {
      pub calls: AtomicUsize,
    }

    impl Flaky {
      pub fn new() -> Self {
        Self {
          calls: AtomicUsize::new(0),
        }
      }
    }

    #[async_trait]
    impl embedding::EmbeddingBackend for Flaky {
      fn model_id(&self) -> &str {
        "cpu:flaky"
      }

      fn dimensions(&self) -> usize {
        4
      }

      fn capabilities(&self) -> Capabilities {
        Capabilities {
          can_embed: true,
          // Keyphrase-capable so the test exercises only chunk batches
          can_extract_keyphrases: true,
          service_kind: ServiceKind::LocalTensor,
        }
      }

      fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Ready
      }

      async fn initialize(&self) -> Result<(), EmbeddingError> {
        Ok(())
      }

      async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call == 1 {
          return Err(EmbeddingError::Timeout);
        }
        Ok(
          texts
            .iter()
            .map(|t| Some(EmbeddingVector::new(vec![t.len() as f32, 1.0, 0.0, 0.0], "cpu:flaky")))
            .collect(),
        )
      }

      async fn extract_keyphrases(
        &self,
        texts: &[&str],
        _top_k: usize,
      ) -> Result<Vec<Vec<KeyPhrase>>, EmbeddingError> {
        Ok(texts.iter().map(|_| Vec::new()).collect())
      }
    }
  }

  #[tokio::test]
  async fn test_keyphrase_capable_backend_uses_its_own_api() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
      dir.path().join("a.md"),
      "# A\n\nShort document processed by the keyphrase-capable backend.",
    )
    .unwrap();

    let backend = Arc::new(mock_backends::KeyphraseCapable::new());
    let db = Arc::new(FolderDb::open(dir.path(), 4, "gpu:mock").await.unwrap());
    let pipe = FilePipeline::new(
      db.clone(),
      backend.clone(),
      PipelineConfig::default(),
      CancellationToken::new(),
    );

    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    let stats = pipe.index_changes(dir.path(), &changes).await.unwrap();
    assert_eq!(stats.files_processed, 1);

    // One chunk-embedding batch plus one document-keyword batch, and no
    // per-candidate traffic: the n-gram strategy never ran.
    assert!(backend.keyphrase_calls.load(Ordering::Relaxed) >= 1);
    assert_eq!(backend.embed_calls.load(Ordering::Relaxed), 2);

    let chunks = db.chunks_for_document("a.md").await.unwrap();
    assert!(chunks.iter().all(|c| c.key_phrases[0].text.starts_with("worker phrase")));
  }

  #[tokio::test]
  async fn test_partial_batch_persists_subset_then_retry_completes() {
    let dir = TempDir::new().unwrap();
    // Enough text for several chunks so multiple embed batches run
    let body: String = (0..60)
      .map(|i| format!("Paragraph {i} with plenty of filler words to make chunks large enough to split.\n\n"))
      .collect();
    std::fs::write(dir.path().join("big.md"), format!("# Big\n\n{body}")).unwrap();

    let backend = Arc::new(mock_backends::Flaky::new());
    let db = Arc::new(FolderDb::open(dir.path(), 4, "cpu:flaky").await.unwrap());
    let config = PipelineConfig {
      batch_size: 1, // one chunk per batch: every odd batch fails
      ..Default::default()
    };
    let pipe = FilePipeline::new(db.clone(), backend.clone(), config, CancellationToken::new());

    let fp = foldex_core::fingerprint_file(&dir.path().join("big.md"), dir.path()).unwrap();
    let outcome = pipe.process_file(dir.path(), &fp).await.unwrap();

    let total_chunks = match outcome {
      FileOutcome::Indexed { chunks, partial } => {
        assert!(partial, "the failed batch must leave a gap");
        chunks
      }
      other => panic!("unexpected outcome {other:?}"),
    };

    // Only the successful pairs were persisted, 1:1
    assert_eq!(db.count_chunks(Some("big.md")).await.unwrap(), total_chunks);
    assert_eq!(db.count_embeddings(Some("big.md")).await.unwrap(), total_chunks);

    // The file stays eligible for retry
    let state = db.get_file_state("big.md").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Failed);
    assert!(!state.corrupted);

    // Retry fills in the missing range and restores dense ordering
    match pipe.process_file(dir.path(), &fp).await.unwrap() {
      FileOutcome::Indexed { partial: false, chunks } => {
        let rows = db.chunks_for_document("big.md").await.unwrap();
        assert_eq!(rows.len(), chunks);
        for (i, row) in rows.iter().enumerate() {
          assert_eq!(row.chunk_index, i as u32);
        }
        assert_eq!(db.count_embeddings(Some("big.md")).await.unwrap(), chunks);
      }
      other => panic!("retry should complete, got {other:?}"),
    }

    let state = db.get_file_state("big.md").await.unwrap().unwrap();
    assert_eq!(state.state, ProcessingState::Indexed);
  }

  #[tokio::test]
  async fn test_search_after_indexing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
      dir.path().join("db.md"),
      "# Databases\n\nVector databases store embeddings for similarity search over document chunks.",
    )
    .unwrap();
    std::fs::write(
      dir.path().join("garden.md"),
      "# Gardening\n\nTomatoes need full sun and regular watering through the summer months.",
    )
    .unwrap();

    let (db, backend) = setup(&dir).await;
    let pipe = pipeline(db.clone(), backend.clone());
    let changes = detect_changes(dir.path(), excludes(), &db).await.unwrap();
    pipe.index_changes(dir.path(), &changes).await.unwrap();

    let query = backend.embed_query("vector similarity search embeddings").await.unwrap();
    let hits = db
      .search_chunks(&query.vector, &db::SearchOptions::new(2))
      .await
      .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].document_id, "db.md");
  }
}
