use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable per-file processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
  Pending,
  Processing,
  Indexed,
  Failed,
  Skipped,
  Deleted,
}

impl ProcessingState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProcessingState::Pending => "pending",
      ProcessingState::Processing => "processing",
      ProcessingState::Indexed => "indexed",
      ProcessingState::Failed => "failed",
      ProcessingState::Skipped => "skipped",
      ProcessingState::Deleted => "deleted",
    }
  }
}

impl std::str::FromStr for ProcessingState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(ProcessingState::Pending),
      "processing" => Ok(ProcessingState::Processing),
      "indexed" => Ok(ProcessingState::Indexed),
      "failed" => Ok(ProcessingState::Failed),
      "skipped" => Ok(ProcessingState::Skipped),
      "deleted" => Ok(ProcessingState::Deleted),
      _ => Err(format!("unknown processing state: {s}")),
    }
  }
}

/// One row of the file-state table. At most one row exists per file path.
///
/// `content_hash` matches the hash in effect when the file last reached
/// `Indexed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
  pub file_path: String,
  pub content_hash: String,
  pub state: ProcessingState,
  pub attempt_count: u32,
  pub last_attempt: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  #[serde(default)]
  pub corrupted: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chunk_count: Option<u32>,
}

impl FileState {
  /// Fresh row for a file entering processing.
  pub fn processing(file_path: &str, content_hash: &str, attempt_count: u32) -> Self {
    Self {
      file_path: file_path.to_string(),
      content_hash: content_hash.to_string(),
      state: ProcessingState::Processing,
      attempt_count,
      last_attempt: Utc::now(),
      last_error: None,
      corrupted: false,
      chunk_count: None,
    }
  }

  pub fn mark_success(mut self, chunk_count: u32) -> Self {
    self.state = ProcessingState::Indexed;
    self.chunk_count = Some(chunk_count);
    self.last_error = None;
    self.last_attempt = Utc::now();
    self
  }

  pub fn mark_failure(mut self, reason: &str, corrupted: bool) -> Self {
    self.state = ProcessingState::Failed;
    self.attempt_count += 1;
    self.last_error = Some(reason.to_string());
    self.corrupted = corrupted;
    self.last_attempt = Utc::now();
    self
  }

  pub fn mark_skipped(mut self, reason: &str) -> Self {
    self.state = ProcessingState::Skipped;
    self.last_error = Some(reason.to_string());
    self.last_attempt = Utc::now();
    self
  }
}

/// What the pipeline should do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
  Process,
  Skip,
  Retry,
  Ignore,
}

/// Processing decision with its reason, for logging and status output.
#[derive(Debug, Clone)]
pub struct Decision {
  pub action: DecisionAction,
  pub reason: &'static str,
}

impl Decision {
  pub fn new(action: DecisionAction, reason: &'static str) -> Self {
    Self { action, reason }
  }

  pub fn should_process(&self) -> bool {
    matches!(self.action, DecisionAction::Process | DecisionAction::Retry)
  }
}
