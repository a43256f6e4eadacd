use thiserror::Error;

/// Boundary error type surfaced by the daemon and CLI.
///
/// Individual crates carry their own error enums; this is the shape they
/// collapse to at the component seams.
#[derive(Error, Debug)]
pub enum Error {
  #[error("Configuration: {0}")]
  Config(String),

  #[error("Not found: {entity} {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("Filesystem: {0}")]
  Filesystem(String),

  #[error("Parse: {message}")]
  Parse { message: String, corrupted: bool },

  #[error("Embedding: {0}")]
  Embedding(String),

  #[error("Extraction: {0}")]
  Extraction(String),

  #[error("Storage: {0}")]
  Storage(String),

  #[error("Cancelled")]
  Cancelled,

  #[error("IO: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Whether a failed file is worth retrying on a later run.
  pub fn is_recoverable(&self) -> bool {
    match self {
      Error::Parse { corrupted, .. } => !corrupted,
      Error::Config(_) | Error::NotFound { .. } => false,
      _ => true,
    }
  }
}
