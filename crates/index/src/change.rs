//! Change detection: current filesystem fingerprints diffed against the
//! stored file-state of the last indexed snapshot.

use db::FolderDb;
use foldex_core::ChangeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::scanner::{ScanError, Scanner};

#[derive(Error, Debug)]
pub enum ChangeError {
  #[error("Scan error: {0}")]
  Scan(#[from] ScanError),
  #[error("Database error: {0}")]
  Database(#[from] db::DbError),
}

/// Diff the folder's current supported files against previously indexed
/// fingerprints (rows in state INDEXED only).
pub async fn detect_changes(root: &Path, excludes: Vec<String>, folder_db: &FolderDb) -> Result<ChangeSet, ChangeError> {
  let scan = Scanner::new(excludes).scan(root)?;
  let previous = folder_db.indexed_hashes().await?;
  let changeset = ChangeSet::compute(scan.files, &previous);

  debug!(
    new = changeset.new.len(),
    modified = changeset.modified.len(),
    deleted = changeset.deleted.len(),
    unchanged = changeset.unchanged.len(),
    requires_full_reindex = changeset.summary.requires_full_reindex,
    "Change detection complete"
  );

  Ok(changeset)
}
