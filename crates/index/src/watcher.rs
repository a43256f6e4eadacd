//! Filesystem watcher feeding incremental single-file updates into the
//! pipeline while the daemon runs.
//!
//! Raw notify events are translated into the three change kinds the
//! pipeline acts on. Renames arrive as paired name events and become a
//! delete of the old path plus a create of the new one; churn under the
//! per-folder database directory is dropped during translation since
//! the store rewrites itself constantly while indexing.

use foldex_core::CACHE_DIR_NAME;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, channel};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum WatchError {
  #[error("Notify error: {0}")]
  Notify(#[from] notify::Error),
}

/// Type of file change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

/// A file change event.
#[derive(Debug, Clone)]
pub struct FileChange {
  pub path: PathBuf,
  pub kind: ChangeKind,
}

/// Recursive watcher over one indexed folder.
pub struct FileWatcher {
  receiver: Receiver<notify::Result<Event>>,
  root: PathBuf,
  _inner: RecommendedWatcher,
}

impl FileWatcher {
  pub fn watch(root: &Path) -> Result<Self, WatchError> {
    let (tx, receiver) = channel();
    let mut inner = notify::recommended_watcher(move |event| {
      let _ = tx.send(event);
    })?;
    inner.watch(root, RecursiveMode::Recursive)?;

    Ok(Self {
      receiver,
      root: root.to_path_buf(),
      _inner: inner,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Translate and return every event delivered since the last call.
  pub fn drain(&self) -> Vec<FileChange> {
    let mut changes = Vec::new();
    while let Ok(result) = self.receiver.try_recv() {
      match result {
        Ok(event) => translate(&event, &mut changes),
        Err(e) => warn!(error = %e, "Watch backend error"),
      }
    }
    changes
  }
}

/// Map one notify event onto pipeline change kinds, path by path.
fn translate(event: &Event, out: &mut Vec<FileChange>) {
  // A completed rename carries [from, to]: the old path dies, the new
  // one is born
  if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) && event.paths.len() == 2 {
    push_change(out, &event.paths[0], ChangeKind::Deleted);
    push_change(out, &event.paths[1], ChangeKind::Created);
    return;
  }

  let kind = match event.kind {
    EventKind::Create(_) => ChangeKind::Created,
    EventKind::Remove(_) => ChangeKind::Deleted,
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
    EventKind::Modify(_) => ChangeKind::Modified,
    EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
  };

  for path in &event.paths {
    push_change(out, path, kind.clone());
  }
}

fn push_change(out: &mut Vec<FileChange>, path: &Path, kind: ChangeKind) {
  // The store under .foldex/ churns while indexing; never feed it back
  if path.components().any(|c| c.as_os_str() == CACHE_DIR_NAME) {
    return;
  }
  // Directory events carry no indexable content (deletes can no longer
  // be stat'ed, so they pass through)
  if kind != ChangeKind::Deleted && path.is_dir() {
    return;
  }
  out.push(FileChange {
    path: path.to_path_buf(),
    kind,
  });
}
