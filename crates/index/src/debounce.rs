//! Event debouncing for the folder watcher.
//!
//! Editors and sync tools produce bursts of events per file (temp file,
//! rename, several writes). Rather than replaying each event, every
//! path accumulates a burst and the net effect is emitted once the
//! burst has been quiet long enough:
//!
//! - born in the burst and still present → Created
//! - present before and still present   → Modified
//! - present before, gone at the end    → Deleted
//! - born and gone within the burst     → nothing; the pipeline never
//!   needs to hear about a temp file that came and went

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::watcher::{ChangeKind, FileChange, FileWatcher, WatchError};

#[derive(Debug, Clone)]
pub struct DebounceConfig {
  /// How long a burst must stay quiet before it is emitted.
  pub quiet_period: Duration,
  /// Backlog size at which the caller should flush regardless.
  pub max_backlog: usize,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      quiet_period: Duration::from_millis(500),
      max_backlog: 256,
    }
  }
}

/// Accumulated event burst for one path.
#[derive(Debug)]
struct Burst {
  /// The burst's first event was a create.
  born: bool,
  /// The burst's latest event was a delete.
  gone: bool,
  /// When the burst may be emitted.
  quiet_at: Instant,
}

impl Burst {
  fn net_effect(self, path: PathBuf) -> Option<FileChange> {
    let kind = match (self.born, self.gone) {
      (true, true) => return None,
      (true, false) => ChangeKind::Created,
      (false, true) => ChangeKind::Deleted,
      (false, false) => ChangeKind::Modified,
    };
    Some(FileChange { path, kind })
  }
}

/// Watcher front-end that coalesces raw events into per-path bursts.
pub struct DebouncedWatcher {
  watcher: FileWatcher,
  config: DebounceConfig,
  bursts: HashMap<PathBuf, Burst>,
}

impl DebouncedWatcher {
  pub fn new(root: &Path, config: DebounceConfig) -> Result<Self, WatchError> {
    Ok(Self {
      watcher: FileWatcher::watch(root)?,
      config,
      bursts: HashMap::new(),
    })
  }

  pub fn with_defaults(root: &Path) -> Result<Self, WatchError> {
    Self::new(root, DebounceConfig::default())
  }

  pub fn root(&self) -> &Path {
    self.watcher.root()
  }

  /// Fold one change into its path's burst.
  fn note(&mut self, change: FileChange) {
    let quiet_at = Instant::now() + self.config.quiet_period;
    let deleted = change.kind == ChangeKind::Deleted;

    self
      .bursts
      .entry(change.path)
      .and_modify(|burst| {
        burst.gone = deleted;
        burst.quiet_at = quiet_at;
      })
      .or_insert(Burst {
        born: change.kind == ChangeKind::Created,
        gone: deleted,
        quiet_at,
      });
  }

  fn absorb(&mut self) {
    for change in self.watcher.drain() {
      self.note(change);
    }
  }

  /// Emit the bursts whose quiet period has elapsed.
  pub fn settled(&mut self) -> Vec<FileChange> {
    self.absorb();

    let now = Instant::now();
    let ready: Vec<PathBuf> = self
      .bursts
      .iter()
      .filter(|(_, burst)| burst.quiet_at <= now)
      .map(|(path, _)| path.clone())
      .collect();

    ready
      .into_iter()
      .filter_map(|path| {
        let burst = self.bursts.remove(&path)?;
        burst.net_effect(path)
      })
      .collect()
  }

  /// Emit every burst immediately, quiet or not.
  pub fn flush(&mut self) -> Vec<FileChange> {
    self.absorb();
    self
      .bursts
      .drain()
      .filter_map(|(path, burst)| burst.net_effect(path))
      .collect()
  }

  pub fn backlog(&self) -> usize {
    self.bursts.len()
  }

  /// Whether the backlog is large enough that waiting for quiet is no
  /// longer worth it.
  pub fn overflowing(&self) -> bool {
    self.bursts.len() >= self.config.max_backlog
  }
}
