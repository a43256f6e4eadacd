pub mod change;
pub mod config;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod state;

pub use change::{ChangeSet, ChangeSummary, FULL_REINDEX_RATIO};
pub use config::{
  CACHE_DIR_NAME, Config, DEFAULT_EXCLUDES, EmbeddingConfig, FolderConfig, IndexConfig, SchedulerConfig,
  default_config_dir, default_config_file, default_data_dir, model_cache_dir,
};
pub use document::{
  CHARS_PER_TOKEN, DocumentChunk, DocumentMetadata, DocumentRecord, ExtractionParams, FileType, KeyPhrase,
  MIN_CHUNK_CHARS, chunk_id, effective_chunk_chars, estimate_tokens,
};
pub use error::{Error, Result};
pub use fingerprint::{FileFingerprint, content_hash, fingerprint_file};
pub use state::{Decision, DecisionAction, FileState, ProcessingState};
