use foldex_core::{FileFingerprint, FileType, fingerprint_file};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ScanError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Walk error: {0}")]
  Walk(#[from] ignore::Error),
}

/// Result of scanning a folder.
#[derive(Debug)]
pub struct ScanResult {
  pub files: Vec<FileFingerprint>,
  pub skipped_count: u32,
  pub total_bytes: u64,
  pub scan_duration: Duration,
}

/// Folder scanner: walks the tree, applies the extension allow-list and
/// exclude globs, and fingerprints supported files in parallel.
pub struct Scanner {
  max_file_size: u64,
  excludes: Vec<String>,
}

impl Scanner {
  pub fn new(excludes: Vec<String>) -> Self {
    Self {
      max_file_size: 50 * 1024 * 1024,
      excludes,
    }
  }

  pub fn with_max_file_size(mut self, size: u64) -> Self {
    self.max_file_size = size;
    self
  }

  /// Scan a folder, fingerprinting supported files in parallel.
  pub fn scan(&self, root: &Path) -> Result<ScanResult, ScanError> {
    let start = Instant::now();
    let skipped = AtomicU32::new(0);
    let total_bytes = AtomicU64::new(0);

    let mut overrides = OverrideBuilder::new(root);
    for glob in &self.excludes {
      // Bare names exclude the whole subtree; everything else is a glob
      let pattern = if glob.contains('*') || glob.contains('/') {
        format!("!{glob}")
      } else {
        format!("!**/{glob}")
      };
      if let Err(e) = overrides.add(&pattern) {
        warn!(glob, error = %e, "Ignoring invalid exclude glob");
      }
    }
    let overrides = overrides.build()?;

    let walker = WalkBuilder::new(root)
      .follow_links(false)
      .hidden(true)
      .git_ignore(false)
      .git_global(false)
      .git_exclude(false)
      .overrides(overrides)
      .build();

    let candidates: Vec<PathBuf> = walker
      .filter_map(|entry| entry.ok())
      .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
      .map(|entry| entry.into_path())
      .collect();

    let files: Vec<FileFingerprint> = candidates
      .into_par_iter()
      .filter_map(|path| {
        FileType::from_path(&path)?;

        let metadata = path.metadata().ok()?;
        if metadata.len() == 0 || metadata.len() > self.max_file_size {
          skipped.fetch_add(1, Ordering::Relaxed);
          return None;
        }

        match fingerprint_file(&path, root) {
          Ok(fp) => {
            total_bytes.fetch_add(fp.size_bytes, Ordering::Relaxed);
            Some(fp)
          }
          Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to fingerprint file");
            skipped.fetch_add(1, Ordering::Relaxed);
            None
          }
        }
      })
      .collect();

    let mut files = files;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(ScanResult {
      files,
      skipped_count: skipped.load(Ordering::Relaxed),
      total_bytes: total_bytes.load(Ordering::Relaxed),
      scan_duration: start.elapsed(),
    })
  }

  /// Fingerprint a single file if it is supported and within limits.
  pub fn scan_file(&self, path: &Path, root: &Path) -> Option<FileFingerprint> {
    FileType::from_path(path)?;
    let metadata = path.metadata().ok()?;
    if metadata.len() == 0 || metadata.len() > self.max_file_size {
      return None;
    }
    fingerprint_file(path, root).ok()
  }
}
