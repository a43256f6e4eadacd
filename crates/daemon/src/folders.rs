//! Folder registry: resolved folder path → shared store handle.
//!
//! Every document write flows through the folder's own store obtained
//! here; there is no shared write path across folders.

use db::FolderDb;
use embedding::{BackendRegistry, EmbeddingBackend, EmbeddingError};
use foldex_core::{Config, FolderConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("Database error: {0}")]
  Database(#[from] db::DbError),
  #[error("Embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
  #[error("Configuration: {0}")]
  Config(String),
}

pub struct FolderRegistry {
  config: Arc<Config>,
  backends: Arc<BackendRegistry>,
  folders: RwLock<HashMap<PathBuf, Arc<FolderDb>>>,
}

impl FolderRegistry {
  pub fn new(config: Arc<Config>, backends: Arc<BackendRegistry>) -> Self {
    Self {
      config,
      backends,
      folders: RwLock::new(HashMap::new()),
    }
  }

  pub fn backends(&self) -> &Arc<BackendRegistry> {
    &self.backends
  }

  /// Model id a folder indexes with: its own override or the default.
  pub fn model_for(&self, folder: &FolderConfig) -> String {
    folder.model.clone().unwrap_or_else(|| self.config.embedding.model.clone())
  }

  /// Open (or return the cached) store for a folder, together with its
  /// embedding back-end. The back-end is created first so the store is
  /// opened with the model's true dimensionality.
  pub async fn get_or_open(
    &self,
    folder: &FolderConfig,
  ) -> Result<(Arc<FolderDb>, Arc<dyn EmbeddingBackend>), RegistryError> {
    let resolved = folder
      .resolved_path()
      .map_err(|e| RegistryError::Config(e.to_string()))?;

    let model_id = self.model_for(folder);
    let backend = self.backends.get_or_create(&model_id).await?;

    {
      let folders = self.folders.read().await;
      if let Some(db) = folders.get(&resolved) {
        return Ok((db.clone(), backend));
      }
    }

    let mut folders = self.folders.write().await;
    // Double-checked: another task may have opened it while we waited
    if let Some(db) = folders.get(&resolved) {
      return Ok((db.clone(), backend));
    }

    info!(folder = %resolved.display(), model = %model_id, "Opening folder store");
    let db = Arc::new(FolderDb::open(&resolved, backend.dimensions(), &model_id).await?);
    folders.insert(resolved, db.clone());
    Ok((db, backend))
  }

  /// Already-open store for a resolved path, if any.
  pub async fn get(&self, resolved: &Path) -> Option<Arc<FolderDb>> {
    self.folders.read().await.get(resolved).cloned()
  }

  pub async fn open_paths(&self) -> Vec<PathBuf> {
    self.folders.read().await.keys().cloned().collect()
  }

  /// Flush every open store's file-state journal.
  pub async fn checkpoint_all(&self) -> usize {
    let folders: Vec<Arc<FolderDb>> = self.folders.read().await.values().cloned().collect();
    let mut flushed = 0;
    for db in folders {
      match db.checkpoint().await {
        Ok(n) => flushed += n,
        Err(e) => warn!(folder = %db.folder_path.display(), error = %e, "Checkpoint failed"),
      }
    }
    flushed
  }

  /// Startup recovery across all configured folders: rows stuck in
  /// PROCESSING reset to PENDING. Returns the total reset count.
  pub async fn recover_configured(&self) -> usize {
    let mut total = 0;
    for folder in &self.config.folders {
      match self.get_or_open(folder).await {
        Ok((db, _)) => match db.recover_interrupted().await {
          Ok(n) => total += n,
          Err(e) => warn!(folder = %folder.path.display(), error = %e, "Recovery failed"),
        },
        Err(e) => warn!(folder = %folder.path.display(), error = %e, "Cannot open folder for recovery"),
      }
    }
    total
  }
}
