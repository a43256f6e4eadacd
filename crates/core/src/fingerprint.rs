use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Error, Result};

/// Filesystem fingerprint used for change detection.
///
/// `relative_path` is unique within one folder snapshot; `content_hash` is
/// stable over identical bytes regardless of mtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
  pub relative_path: String,
  pub content_hash: String,
  pub size_bytes: u64,
  pub modified: DateTime<Utc>,
}

/// SHA-256 digest of a byte slice, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

/// Fingerprint one file relative to its folder root.
pub fn fingerprint_file(path: &Path, root: &Path) -> Result<FileFingerprint> {
  let relative_path = path
    .strip_prefix(root)
    .map_err(|_| Error::Filesystem(format!("{} is outside {}", path.display(), root.display())))?
    .to_string_lossy()
    .to_string();

  let metadata = std::fs::metadata(path)?;
  let bytes = std::fs::read(path)?;
  let modified: DateTime<Utc> = metadata.modified()?.into();

  Ok(FileFingerprint {
    relative_path,
    content_hash: content_hash(&bytes),
    size_bytes: metadata.len(),
    modified,
  })
}
