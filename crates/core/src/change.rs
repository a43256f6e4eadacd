use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::fingerprint::FileFingerprint;

/// Change ratio above which a full reindex is suggested.
pub const FULL_REINDEX_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
  pub total_changes: usize,
  /// Advisory only: the detector reports, the caller decides.
  pub requires_full_reindex: bool,
}

/// Quadripartite partition produced by change detection.
///
/// Invariant: `new ∪ modified ∪ unchanged = current`,
/// `deleted = previous \ current`, and the sets are pairwise disjoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
  pub new: Vec<FileFingerprint>,
  pub modified: Vec<FileFingerprint>,
  pub deleted: Vec<String>,
  pub unchanged: Vec<FileFingerprint>,
  pub summary: ChangeSummary,
}

impl ChangeSet {
  /// Diff current filesystem fingerprints against previously indexed
  /// hashes (`relative_path → content_hash`).
  pub fn compute(current: Vec<FileFingerprint>, previous: &HashMap<String, String>) -> Self {
    let current_count = current.len();
    let previous_count = previous.len();

    let mut new = Vec::new();
    let mut modified = Vec::new();
    let mut unchanged = Vec::new();

    for fp in current {
      match previous.get(&fp.relative_path) {
        None => new.push(fp),
        Some(hash) if *hash == fp.content_hash => unchanged.push(fp),
        Some(_) => modified.push(fp),
      }
    }

    let current_paths: std::collections::HashSet<&str> = new
      .iter()
      .chain(modified.iter())
      .chain(unchanged.iter())
      .map(|fp| fp.relative_path.as_str())
      .collect();

    let mut deleted: Vec<String> = previous
      .keys()
      .filter(|path| !current_paths.contains(path.as_str()))
      .cloned()
      .collect();
    deleted.sort();

    let total_changes = new.len() + modified.len() + deleted.len();
    let denominator = current_count.max(previous_count).max(1) as f64;
    let requires_full_reindex = total_changes as f64 / denominator > FULL_REINDEX_RATIO;

    Self {
      new,
      modified,
      deleted,
      unchanged,
      summary: ChangeSummary {
        total_changes,
        requires_full_reindex,
      },
    }
  }

  /// Files that need (re)processing.
  pub fn to_process(&self) -> impl Iterator<Item = &FileFingerprint> {
    self.new.iter().chain(self.modified.iter())
  }

  pub fn is_empty(&self) -> bool {
    self.summary.total_changes == 0
  }
}
