//! Multi-folder scheduler.
//!
//! Runs folder jobs under the resource manager's admission control,
//! tracks per-folder job state (idle → indexing → completed | failed |
//! cancelled → idle), and surfaces progress and cooperative
//! cancellation.

use chrono::{DateTime, Utc};
use foldex_core::{ChangeSet, Config, FolderConfig};
use index::{FilePipeline, IndexProgress, PipelineConfig, PipelineError, Scanner, detect_changes};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::folders::FolderRegistry;
use crate::resource::{AdmitError, ResourceManager, estimate_memory_mb};

/// Options for one scheduling request.
#[derive(Debug, Clone)]
pub struct IndexOptions {
  /// Bypass change detection and reprocess every supported file.
  pub force_reindex: bool,
  /// Keep going when a folder fails; when false, the first folder
  /// failure cancels its siblings.
  pub continue_on_error: bool,
  /// Override for the scheduler fan-out ceiling.
  pub max_concurrent_folders: Option<usize>,
  /// Restrict `index_all` to these folder names (empty = all).
  pub include: Vec<String>,
  /// Exclude these folder names from `index_all`.
  pub exclude: Vec<String>,
}

impl Default for IndexOptions {
  fn default() -> Self {
    Self {
      force_reindex: false,
      continue_on_error: true,
      max_concurrent_folders: None,
      include: Vec::new(),
      exclude: Vec::new(),
    }
  }
}

/// Result of one folder job.
#[derive(Debug, Clone, Serialize)]
pub struct FolderResult {
  pub folder: PathBuf,
  pub name: String,
  pub success: bool,
  pub cancelled: bool,
  pub files_processed: usize,
  pub files_skipped: usize,
  pub files_failed: usize,
  pub chunks_written: usize,
  pub embeddings_written: usize,
  pub requires_full_reindex: bool,
  pub duration_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub errors: Vec<String>,
}

impl FolderResult {
  fn failed(folder: PathBuf, name: String, error: String) -> Self {
    Self {
      folder,
      name,
      success: false,
      cancelled: false,
      files_processed: 0,
      files_skipped: 0,
      files_failed: 0,
      chunks_written: 0,
      embeddings_written: 0,
      requires_full_reindex: false,
      duration_ms: 0,
      error: Some(error),
      errors: Vec::new(),
    }
  }
}

/// Aggregated result of a multi-folder run.
#[derive(Debug, Clone, Serialize)]
pub struct MultiFolderResult {
  pub folders: Vec<FolderResult>,
  pub total_files: usize,
  pub total_chunks: usize,
  pub total_embeddings: usize,
  pub avg_files_per_sec: f64,
  pub duration_ms: u64,
  pub success: bool,
  /// Manager-level issues (queue-full, cancellation), as opposed to
  /// per-folder errors.
  pub system_errors: Vec<String>,
}

/// Live status of one folder.
#[derive(Debug, Clone, Serialize)]
pub struct FolderStatus {
  pub is_indexing: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub estimated_completion: Option<DateTime<Utc>>,
  pub total_files: usize,
  pub processed_files: usize,
  pub total_chunks: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_file: Option<String>,
  pub settings: serde_json::Value,
  pub errors: Vec<String>,
}

impl FolderStatus {
  fn idle() -> Self {
    Self {
      is_indexing: false,
      started_at: None,
      estimated_completion: None,
      total_files: 0,
      processed_files: 0,
      total_chunks: 0,
      current_file: None,
      settings: serde_json::Value::Null,
      errors: Vec::new(),
    }
  }
}

struct JobHandle {
  cancel: CancellationToken,
  started_at: DateTime<Utc>,
  progress: Arc<Mutex<IndexProgress>>,
  errors: Arc<Mutex<Vec<String>>>,
  settings: serde_json::Value,
}

pub struct FolderScheduler {
  config: Arc<Config>,
  registry: Arc<FolderRegistry>,
  resources: Arc<ResourceManager>,
  jobs: Mutex<HashMap<PathBuf, Arc<JobHandle>>>,
}

impl FolderScheduler {
  pub fn new(config: Arc<Config>, registry: Arc<FolderRegistry>, resources: Arc<ResourceManager>) -> Self {
    Self {
      config,
      registry,
      resources,
      jobs: Mutex::new(HashMap::new()),
    }
  }

  pub fn registry(&self) -> &Arc<FolderRegistry> {
    &self.registry
  }

  pub fn resources(&self) -> &Arc<ResourceManager> {
    &self.resources
  }

  /// Index one folder under admission control.
  #[tracing::instrument(level = "info", skip(self, folder, options), fields(folder = %folder.path.display()))]
  pub async fn index_folder(&self, folder: &FolderConfig, options: &IndexOptions) -> FolderResult {
    let name = folder.display_name();
    let resolved = match folder.resolved_path() {
      Ok(p) => p,
      Err(e) => return FolderResult::failed(folder.path.clone(), name, e.to_string()),
    };

    let handle = {
      let mut jobs = self.jobs.lock().await;
      if jobs.contains_key(&resolved) {
        return FolderResult::failed(resolved.clone(), name, "folder is already being indexed".to_string());
      }
      let handle = Arc::new(JobHandle {
        cancel: CancellationToken::new(),
        started_at: Utc::now(),
        progress: Arc::new(Mutex::new(IndexProgress::default())),
        errors: Arc::new(Mutex::new(Vec::new())),
        settings: serde_json::json!({
          "model": self.registry.model_for(folder),
          "batch_size": folder.batch_size.unwrap_or(self.config.index.batch_size),
          "force_reindex": options.force_reindex,
        }),
      });
      jobs.insert(resolved.clone(), handle.clone());
      handle
    };

    let result = self.run_folder_job(folder, &resolved, name.clone(), options, &handle).await;

    self.jobs.lock().await.remove(&resolved);
    result
  }

  async fn run_folder_job(
    &self,
    folder: &FolderConfig,
    resolved: &Path,
    name: String,
    options: &IndexOptions,
    handle: &Arc<JobHandle>,
  ) -> FolderResult {
    let started = Instant::now();

    let estimate = estimate_memory_mb(resolved);
    let permit = match self.resources.admit(estimate, &handle.cancel).await {
      Ok(p) => p,
      Err(AdmitError::QueueFull) => {
        return FolderResult::failed(resolved.to_path_buf(), name, "admission queue full".to_string());
      }
      Err(AdmitError::Cancelled) => {
        let mut result = FolderResult::failed(resolved.to_path_buf(), name, "cancelled".to_string());
        result.cancelled = true;
        return result;
      }
    };

    let result = self
      .run_admitted(folder, resolved, name.clone(), options, handle, started)
      .await;

    self.resources.release(permit).await;
    result
  }

  async fn run_admitted(
    &self,
    folder: &FolderConfig,
    resolved: &Path,
    name: String,
    options: &IndexOptions,
    handle: &Arc<JobHandle>,
    started: Instant,
  ) -> FolderResult {
    let (db, backend) = match self.registry.get_or_open(folder).await {
      Ok(pair) => pair,
      Err(e) => return FolderResult::failed(resolved.to_path_buf(), name, e.to_string()),
    };

    let excludes = folder.exclude_globs();
    let changeset = if options.force_reindex {
      // Bypass change detection entirely: every supported file is new
      match Scanner::new(excludes.clone()).scan(resolved) {
        Ok(scan) => {
          let mut set = ChangeSet::default();
          set.summary.total_changes = scan.files.len();
          set.new = scan.files;
          set
        }
        Err(e) => return FolderResult::failed(resolved.to_path_buf(), name, e.to_string()),
      }
    } else {
      match detect_changes(resolved, excludes, &db).await {
        Ok(set) => set,
        Err(e) => return FolderResult::failed(resolved.to_path_buf(), name, e.to_string()),
      }
    };

    let requires_full_reindex = changeset.summary.requires_full_reindex;

    let (progress_tx, mut progress_rx) = mpsc::channel::<IndexProgress>(64);
    let progress_slot = handle.progress.clone();
    let progress_task = tokio::spawn(async move {
      while let Some(update) = progress_rx.recv().await {
        let mut slot = progress_slot.lock().await;
        if update.total_files > 0 {
          slot.total_files = update.total_files;
          slot.processed_files = update.processed_files;
          slot.total_chunks = update.total_chunks;
          slot.processed_chunks = update.processed_chunks;
        }
        slot.current_file = update.current_file.clone();
        slot.percent = update.percent;
      }
    });

    let pipeline_config = PipelineConfig::from_configs(&self.config.index, &self.config.embedding, folder.batch_size);
    let pipeline = FilePipeline::new(db, backend, pipeline_config, handle.cancel.clone())
      .with_throttle(self.resources.throttled_flag())
      .with_progress(progress_tx);

    let outcome = pipeline.index_changes(resolved, &changeset).await;
    progress_task.abort();

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
      Ok(stats) => {
        {
          let mut errors = handle.errors.lock().await;
          errors.extend(stats.errors.iter().cloned());
        }
        FolderResult {
          folder: resolved.to_path_buf(),
          name,
          success: true,
          cancelled: false,
          files_processed: stats.files_processed,
          files_skipped: stats.files_skipped,
          files_failed: stats.files_failed,
          chunks_written: stats.chunks_written,
          embeddings_written: stats.embeddings_written,
          requires_full_reindex,
          duration_ms,
          error: None,
          errors: stats.errors,
        }
      }
      Err(PipelineError::Cancelled) => {
        info!(folder = %resolved.display(), "Folder job cancelled");
        let mut result = FolderResult::failed(resolved.to_path_buf(), name, "cancelled".to_string());
        result.cancelled = true;
        result.duration_ms = duration_ms;
        result
      }
      Err(e) => {
        warn!(folder = %resolved.display(), error = %e, "Folder job failed");
        let mut result = FolderResult::failed(resolved.to_path_buf(), name, e.to_string());
        result.duration_ms = duration_ms;
        result
      }
    }
  }

  /// Index many folders with bounded fan-out.
  pub async fn index_all(self: Arc<Self>, folders: &[FolderConfig], options: &IndexOptions) -> MultiFolderResult {
    let started = Instant::now();
    let mut system_errors = Vec::new();

    let selected: Vec<FolderConfig> = folders
      .iter()
      .filter(|f| options.include.is_empty() || options.include.contains(&f.display_name()))
      .filter(|f| !options.exclude.contains(&f.display_name()))
      .cloned()
      .collect();

    let fan_out = options
      .max_concurrent_folders
      .unwrap_or(self.config.scheduler.max_concurrent_folders)
      .max(1);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(fan_out));
    let abort_siblings = CancellationToken::new();

    let mut handles = Vec::new();
    for folder in selected {
      let scheduler = self.clone();
      let semaphore = semaphore.clone();
      let options = options.clone();
      let abort = abort_siblings.clone();

      handles.push(tokio::spawn(async move {
        let _slot = semaphore.acquire().await;
        if abort.is_cancelled() {
          let name = folder.display_name();
          let mut result = FolderResult::failed(folder.path.clone(), name, "cancelled".to_string());
          result.cancelled = true;
          return result;
        }

        let result = scheduler.index_folder(&folder, &options).await;
        if !result.success && !result.cancelled && !options.continue_on_error {
          // First failure cancels siblings
          abort.cancel();
          scheduler.cancel_all().await;
        }
        result
      }));
    }

    let mut results = Vec::new();
    for handle in handles {
      match handle.await {
        Ok(result) => results.push(result),
        Err(e) => system_errors.push(format!("folder task panicked: {e}")),
      }
    }

    for result in &results {
      if let Some(error) = &result.error
        && (error.contains("queue full") || result.cancelled)
      {
        system_errors.push(format!("{}: {error}", result.name));
      }
    }

    let total_files: usize = results.iter().map(|r| r.files_processed).sum();
    let total_chunks: usize = results.iter().map(|r| r.chunks_written).sum();
    let total_embeddings: usize = results.iter().map(|r| r.embeddings_written).sum();
    let duration_ms = started.elapsed().as_millis() as u64;
    let secs = (duration_ms as f64 / 1000.0).max(0.001);

    MultiFolderResult {
      success: results.iter().all(|r| r.success),
      folders: results,
      total_files,
      total_chunks,
      total_embeddings,
      avg_files_per_sec: total_files as f64 / secs,
      duration_ms,
      system_errors,
    }
  }

  /// Live status for one folder.
  pub async fn status(&self, resolved: &Path) -> FolderStatus {
    let jobs = self.jobs.lock().await;
    let Some(handle) = jobs.get(resolved) else {
      return FolderStatus::idle();
    };

    let progress = handle.progress.lock().await.clone();
    let errors = handle.errors.lock().await.clone();

    // Linear projection from current throughput
    let estimated_completion = if progress.processed_files > 0 && progress.total_files > progress.processed_files {
      let elapsed = Utc::now() - handle.started_at;
      let per_file = elapsed / progress.processed_files as i32;
      let remaining = (progress.total_files - progress.processed_files) as i32;
      Some(Utc::now() + per_file * remaining)
    } else {
      None
    };

    FolderStatus {
      is_indexing: true,
      started_at: Some(handle.started_at),
      estimated_completion,
      total_files: progress.total_files,
      processed_files: progress.processed_files,
      total_chunks: progress.total_chunks,
      current_file: progress.current_file,
      settings: handle.settings.clone(),
      errors,
    }
  }

  pub async fn status_all(&self) -> Vec<(PathBuf, FolderStatus)> {
    let paths: Vec<PathBuf> = self.jobs.lock().await.keys().cloned().collect();
    let mut statuses = Vec::new();
    for path in paths {
      let status = self.status(&path).await;
      statuses.push((path, status));
    }
    statuses
  }

  /// Cooperatively cancel one folder's job. Running work stops at the
  /// next safe point; queued admission is abandoned.
  pub async fn cancel(&self, resolved: &Path) -> bool {
    let jobs = self.jobs.lock().await;
    if let Some(handle) = jobs.get(resolved) {
      info!(folder = %resolved.display(), "Cancelling folder job");
      handle.cancel.cancel();
      true
    } else {
      false
    }
  }

  pub async fn cancel_all(&self) -> usize {
    let jobs = self.jobs.lock().await;
    for handle in jobs.values() {
      handle.cancel.cancel();
    }
    jobs.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use embedding::BackendRegistry;
  use foldex_core::EmbeddingConfig;
  use tempfile::TempDir;

  fn build(config: Config) -> Arc<FolderScheduler> {
    let config = Arc::new(config);
    let backends = Arc::new(BackendRegistry::new(config.embedding.clone()));
    let registry = Arc::new(FolderRegistry::new(config.clone(), backends));
    let resources = Arc::new(ResourceManager::new(config.scheduler.clone()));
    Arc::new(FolderScheduler::new(config, registry, resources))
  }

  fn test_config(dirs: &[&TempDir]) -> Config {
    Config {
      folders: dirs.iter().map(|d| FolderConfig::new(d.path())).collect(),
      embedding: EmbeddingConfig {
        model: "cpu:all-minilm-l6-v2".to_string(),
        ..Default::default()
      },
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_index_folder_result_counts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.md"), "# A\n\nSome content worth indexing here.").unwrap();
    std::fs::write(dir.path().join("b.txt"), "More content in a second file.").unwrap();

    let scheduler = build(test_config(&[&dir]));
    let folder = FolderConfig::new(dir.path());

    let result = scheduler.index_folder(&folder, &IndexOptions::default()).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.files_processed, 2);
    assert_eq!(result.chunks_written, result.embeddings_written);
    assert!(result.error.is_none());
  }

  #[tokio::test]
  async fn test_unchanged_rerun_reports_zero() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.md"), "# A\n\nStable.").unwrap();

    let scheduler = build(test_config(&[&dir]));
    let folder = FolderConfig::new(dir.path());

    let first = scheduler.index_folder(&folder, &IndexOptions::default()).await;
    assert!(first.success);
    assert_eq!(first.files_processed, 1);

    let second = scheduler.index_folder(&folder, &IndexOptions::default()).await;
    assert!(second.success);
    assert_eq!(second.files_processed, 0);
  }

  #[tokio::test]
  async fn test_force_reindex_bypasses_change_detection() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.md"), "# A\n\nStable.").unwrap();

    let scheduler = build(test_config(&[&dir]));
    let folder = FolderConfig::new(dir.path());

    scheduler.index_folder(&folder, &IndexOptions::default()).await;

    let options = IndexOptions {
      force_reindex: true,
      ..Default::default()
    };
    let result = scheduler.index_folder(&folder, &options).await;
    assert!(result.success);
    assert_eq!(result.files_processed, 1);
  }

  #[tokio::test]
  async fn test_index_all_aggregates() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    std::fs::write(dir_a.path().join("a.md"), "# A\n\nFolder a content.").unwrap();
    std::fs::write(dir_b.path().join("b.md"), "# B\n\nFolder b content.").unwrap();

    let config = test_config(&[&dir_a, &dir_b]);
    let folders = config.folders.clone();
    let scheduler = build(config);

    let result = scheduler.clone().index_all(&folders, &IndexOptions::default()).await;
    assert!(result.success);
    assert_eq!(result.folders.len(), 2);
    assert_eq!(result.total_files, 2);
    assert!(result.system_errors.is_empty());
    assert!(result.avg_files_per_sec > 0.0);
  }

  #[tokio::test]
  async fn test_include_filter() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    std::fs::write(dir_a.path().join("a.md"), "content a").unwrap();
    std::fs::write(dir_b.path().join("b.md"), "content b").unwrap();

    let config = test_config(&[&dir_a, &dir_b]);
    let folders = config.folders.clone();
    let include = folders[0].display_name();
    let scheduler = build(config);

    let options = IndexOptions {
      include: vec![include],
      ..Default::default()
    };
    let result = scheduler.clone().index_all(&folders, &options).await;
    assert_eq!(result.folders.len(), 1);
  }

  #[tokio::test]
  async fn test_status_idle_and_cancel_missing() {
    let dir = TempDir::new().unwrap();
    let scheduler = build(test_config(&[&dir]));

    let status = scheduler.status(dir.path()).await;
    assert!(!status.is_indexing);
    assert!(!scheduler.cancel(dir.path()).await);
    assert_eq!(scheduler.cancel_all().await, 0);
  }
}
