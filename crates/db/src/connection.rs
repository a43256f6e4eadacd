use foldex_core::{CACHE_DIR_NAME, FileState};
use lancedb::{Connection, connect};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::schema::{chunks_schema, documents_schema, embeddings_schema, file_states_schema};

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Location of the embedded database for an indexed folder.
pub fn folder_db_path(folder: &Path) -> PathBuf {
  folder.join(CACHE_DIR_NAME).join("lancedb")
}

/// Per-folder store.
///
/// Exclusively owns every persistent row for its folder: documents,
/// chunks, embeddings, and file-processing state. File-state updates are
/// journaled in memory and flushed in batches; `checkpoint` makes them
/// durable.
pub struct FolderDb {
  pub folder_path: PathBuf,
  pub db_path: PathBuf,
  pub connection: Connection,
  pub vector_dim: usize,
  pub model_id: String,
  pub(crate) pending_states: Mutex<HashMap<String, FileState>>,
}

impl FolderDb {
  /// Open or create the store for a folder.
  pub async fn open(folder_path: &Path, vector_dim: usize, model_id: &str) -> Result<Self> {
    let db_path = folder_db_path(folder_path);
    Self::open_at_path(folder_path.to_path_buf(), db_path, vector_dim, model_id).await
  }

  /// Open the store at an explicit database path.
  pub async fn open_at_path(
    folder_path: PathBuf,
    db_path: PathBuf,
    vector_dim: usize,
    model_id: &str,
  ) -> Result<Self> {
    if let Some(parent) = db_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    info!("Opening folder store at {:?}", db_path);
    let connection = connect(db_path.to_string_lossy().as_ref()).execute().await?;

    let db = Self {
      folder_path,
      db_path,
      connection,
      vector_dim,
      model_id: model_id.to_string(),
      pending_states: Mutex::new(HashMap::new()),
    };

    db.ensure_tables().await?;
    Ok(db)
  }

  /// Ensure all required tables exist.
  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;

    if !table_names.contains(&"documents".to_string()) {
      debug!("Creating documents table");
      self
        .connection
        .create_empty_table("documents", documents_schema())
        .execute()
        .await?;
    }

    if !table_names.contains(&"chunks".to_string()) {
      debug!("Creating chunks table");
      self
        .connection
        .create_empty_table("chunks", chunks_schema())
        .execute()
        .await?;
    }

    if !table_names.contains(&"embeddings".to_string()) {
      debug!("Creating embeddings table");
      self
        .connection
        .create_empty_table("embeddings", embeddings_schema(self.vector_dim))
        .execute()
        .await?;
    }

    if !table_names.contains(&"file_states".to_string()) {
      debug!("Creating file_states table");
      self
        .connection
        .create_empty_table("file_states", file_states_schema())
        .execute()
        .await?;
    }

    Ok(())
  }

  pub async fn documents_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("documents").execute().await?)
  }

  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("chunks").execute().await?)
  }

  pub async fn embeddings_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("embeddings").execute().await?)
  }

  pub async fn file_states_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("file_states").execute().await?)
  }

  /// Flush the file-state journal so state survives a restart.
  ///
  /// The pipeline calls this at job end; the daemon also calls it on a
  /// timer. Without it, unflushed INDEXED marks would be lost and the
  /// next run would re-process those files.
  #[tracing::instrument(level = "debug", skip(self), fields(folder = %self.folder_path.display()))]
  pub async fn checkpoint(&self) -> Result<usize> {
    let flushed = self.flush_pending_states().await?;
    if flushed > 0 {
      debug!(flushed, "Checkpointed file states");
    }
    Ok(flushed)
  }
}

/// Escape single quotes in SQL filter strings.
pub(crate) fn escape_sql(s: &str) -> String {
  s.replace('\'', "''")
}
