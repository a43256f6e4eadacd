//! Configuration for the foldex daemon.
//!
//! Config priority: explicit path > ~/.config/foldex/config.toml > defaults.
//! Environment knobs override whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the per-folder cache directory holding the embedded database.
pub const CACHE_DIR_NAME: &str = ".foldex";

/// Patterns always excluded from scans, merged with user-supplied globs.
pub const DEFAULT_EXCLUDES: &[&str] = &[
  ".foldex",
  ".git",
  ".hg",
  ".svn",
  "node_modules",
  "target",
  "dist",
  "build",
  "__pycache__",
  ".venv",
  ".cache",
];

/// One watched folder as the user configured it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
  /// Display name; defaults to the directory name when empty.
  #[serde(default)]
  pub name: String,

  /// Folder path; resolved to an absolute path before use.
  pub path: PathBuf,

  /// Extra exclude globs on top of [`DEFAULT_EXCLUDES`].
  #[serde(default)]
  pub exclude: Vec<String>,

  /// Embedding model id (`provider:model-name`). Falls back to
  /// [`EmbeddingConfig::model`] when unset.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,

  /// Per-folder embedding batch size override.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub batch_size: Option<usize>,

  /// Per-folder concurrency override for the embedding worker pool.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_concurrency: Option<usize>,
}

impl FolderConfig {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      name: String::new(),
      path: path.into(),
      exclude: Vec::new(),
      model: None,
      batch_size: None,
      max_concurrency: None,
    }
  }

  /// Resolve the configured path to its canonical absolute form.
  ///
  /// Folders are identified by this resolved path everywhere else in the
  /// system, so resolution failures are configuration errors.
  pub fn resolved_path(&self) -> Result<PathBuf> {
    self
      .path
      .canonicalize()
      .map_err(|e| Error::Config(format!("cannot resolve folder path {}: {e}", self.path.display())))
  }

  /// Display name, derived from the directory when not configured.
  pub fn display_name(&self) -> String {
    if !self.name.is_empty() {
      return self.name.clone();
    }
    self
      .path
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_else(|| self.path.to_string_lossy().to_string())
  }

  /// Default + user exclude globs.
  pub fn exclude_globs(&self) -> Vec<String> {
    let mut globs: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    globs.extend(self.exclude.iter().cloned());
    globs
  }
}

/// Embedding back-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Default model id (`provider:model-name`, provider ∈ {cpu, gpu}).
  pub model: String,

  /// Model context window in tokens; drives chunk sizing.
  pub context_window: usize,

  /// URL of the out-of-process GPU worker (gpu provider only).
  pub worker_url: String,

  /// Concurrent embedding workers per back-end.
  pub worker_pool_size: usize,

  /// Threads per worker.
  pub num_threads: usize,

  /// Back-end initialization timeout in seconds.
  pub init_timeout_secs: u64,

  /// Per-batch call timeout in seconds.
  pub batch_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      model: "cpu:all-minilm-l6-v2".to_string(),
      context_window: 2048,
      worker_url: "http://127.0.0.1:8765".to_string(),
      worker_pool_size: 2,
      num_threads: 4,
      init_timeout_secs: 30,
      batch_timeout_secs: 60,
    }
  }
}

/// Indexing pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  /// Chunks per embedding batch.
  pub batch_size: usize,

  /// Overlap between adjacent chunks as a fraction of chunk size.
  pub overlap_fraction: f32,

  /// Files larger than this are skipped.
  pub max_file_size_mb: u64,

  /// Retries for failed files before giving up.
  pub max_retries: u32,

  /// Base delay for file-retry backoff in milliseconds (doubles per attempt).
  pub retry_base_ms: u64,

  /// Interval for the periodic file-state checkpoint.
  pub checkpoint_interval_secs: u64,

  /// Keyphrases kept per chunk.
  pub keyphrase_top_k: usize,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      batch_size: 10,
      overlap_fraction: 0.10,
      max_file_size_mb: 50,
      max_retries: 3,
      retry_base_ms: 1000,
      checkpoint_interval_secs: 30,
      keyphrase_top_k: 8,
    }
  }
}

/// Multi-folder scheduler and resource-manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Folder jobs allowed to run at once.
  pub max_concurrent_folders: usize,

  /// Soft memory ceiling for admission and throttling.
  pub memory_limit_mb: u64,

  /// Folders that may wait for admission before `QueueFull`.
  pub queue_capacity: usize,

  /// Memory high-water mark (% of limit) that triggers throttling.
  pub throttle_memory_pct: f32,

  /// CPU high-water mark (%) that triggers throttling.
  pub throttle_cpu_pct: f32,

  /// Resource observer sampling interval.
  pub sample_interval_secs: u64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_concurrent_folders: 3,
      memory_limit_mb: 2048,
      queue_capacity: 8,
      throttle_memory_pct: 80.0,
      throttle_cpu_pct: 85.0,
      sample_interval_secs: 5,
    }
  }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub folders: Vec<FolderConfig>,
  pub embedding: EmbeddingConfig,
  pub index: IndexConfig,
  pub scheduler: SchedulerConfig,
}

impl Config {
  /// Load config from a TOML file.
  pub fn load(path: &Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path)?;
    let mut config: Config =
      toml::from_str(&raw).map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
    config.apply_env_overrides();
    Ok(config)
  }

  /// Load from the default location, falling back to defaults when absent.
  pub fn load_default() -> Result<Self> {
    let path = default_config_file();
    if path.exists() {
      Self::load(&path)
    } else {
      let mut config = Config::default();
      config.apply_env_overrides();
      Ok(config)
    }
  }

  /// Write the config back as TOML (used by `folders add|remove`).
  pub fn save(&self, path: &Path) -> Result<()> {
    let raw =
      toml::to_string_pretty(self).map_err(|e| Error::Config(format!("cannot serialize config: {e}")))?;
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)?;
    Ok(())
  }

  /// Apply environment-variable overrides on top of file values.
  pub fn apply_env_overrides(&mut self) {
    if let Some(n) = env_usize("WORKER_POOL_SIZE") {
      self.embedding.worker_pool_size = n;
    }
    if let Some(n) = env_usize("NUM_THREADS") {
      self.embedding.num_threads = n;
    }
    if let Some(n) = env_usize("BATCH_SIZE") {
      self.index.batch_size = n;
    }
    if let Some(n) = env_usize("MAX_CONCURRENT_FOLDERS") {
      self.scheduler.max_concurrent_folders = n;
    }
    if let Some(n) = env_usize("MEMORY_LIMIT_MB") {
      self.scheduler.memory_limit_mb = n as u64;
    }
  }

  /// Find a configured folder by resolved path.
  pub fn folder_for(&self, resolved: &Path) -> Option<&FolderConfig> {
    self
      .folders
      .iter()
      .find(|f| f.resolved_path().map(|p| p == resolved).unwrap_or(false))
  }
}

fn env_usize(key: &str) -> Option<usize> {
  std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Default config file location.
pub fn default_config_file() -> PathBuf {
  default_config_dir().join("config.toml")
}

/// User config directory (`CONFIG_DIR` > `XDG_CONFIG_HOME` > platform dir).
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("CONFIG_DIR") {
    return PathBuf::from(dir);
  }
  if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg).join("foldex");
  }
  dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("foldex")
}

/// Shared data directory (`DATA_DIR` > `XDG_DATA_HOME` > platform dir).
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("DATA_DIR") {
    return PathBuf::from(dir);
  }
  if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg).join("foldex");
  }
  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("foldex")
}

/// On-disk cache for downloaded model artifacts, shared across folders.
pub fn model_cache_dir() -> PathBuf {
  let base = if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
    PathBuf::from(xdg).join("foldex")
  } else {
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".")).join("foldex")
  };
  base.join("models")
}
