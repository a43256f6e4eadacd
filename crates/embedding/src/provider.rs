use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foldex_core::KeyPhrase;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("Backend not available")]
  NotAvailable,
  #[error("Backend not initialized")]
  NotInitialized,
  #[error("Operation not supported by this backend")]
  NotSupported,
  #[error("Unknown provider: {0}")]
  UnknownProvider(String),
  #[error("Invalid model id: {0} (expected provider:model-name)")]
  InvalidModelId(String),
  #[error("Request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("Backend error: {0}")]
  Backend(String),
  #[error("Network error: {0}")]
  Network(String),
  #[error("Request timed out")]
  Timeout,
}

impl EmbeddingError {
  /// Transient faults worth a retry: the service exists but is busy,
  /// restarting, or the network hiccuped. Everything else is a hard
  /// failure the caller must surface.
  pub fn is_transient(&self) -> bool {
    match self {
      EmbeddingError::Timeout | EmbeddingError::Network(_) => true,
      EmbeddingError::Request(e) => {
        e.is_timeout()
          || e.is_connect()
          || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
      }
      EmbeddingError::Backend(message) => {
        ["429", "502", "503", "504"].iter().any(|code| message.contains(code))
      }
      _ => false,
    }
  }
}

/// Which kind of process serves the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
  /// In-process CPU tensor runtime.
  LocalTensor,
  /// Out-of-process GPU worker speaking sentence-transformers.
  RemoteWorker,
}

/// Declared capability set of a back-end.
///
/// The pipeline selects its keyphrase strategy from this declaration;
/// there is no runtime method probing.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
  pub can_embed: bool,
  pub can_extract_keyphrases: bool,
  pub service_kind: ServiceKind,
}

/// Back-end lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Uninitialized,
  Initializing,
  Ready,
  ShuttingDown,
  Terminated,
}

/// One produced embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingVector {
  pub vector: Vec<f32>,
  pub dim: usize,
  pub model: String,
  pub created_at: DateTime<Utc>,
}

impl EmbeddingVector {
  pub fn new(vector: Vec<f32>, model: &str) -> Self {
    Self {
      dim: vector.len(),
      vector,
      model: model.to_string(),
      created_at: Utc::now(),
    }
  }
}

/// Uniform async embedding API over interchangeable back-ends.
///
/// Batch calls are all-or-partial: the result is positionally aligned
/// with the input and failed positions come back as `None`, so a caller
/// can persist exactly the successful subset.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
  fn model_id(&self) -> &str;
  fn dimensions(&self) -> usize;
  fn capabilities(&self) -> Capabilities;
  fn lifecycle(&self) -> Lifecycle;

  fn service_kind(&self) -> ServiceKind {
    self.capabilities().service_kind
  }

  fn is_initialized(&self) -> bool {
    self.lifecycle() == Lifecycle::Ready
  }

  /// Prepare the back-end for use. Concurrent calls coalesce at the
  /// registry level; implementations may assume one caller.
  async fn initialize(&self) -> Result<(), EmbeddingError>;

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError>;

  async fn embed_query(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
    let mut results = self.embed_batch(&[text]).await?;
    results
      .pop()
      .flatten()
      .ok_or_else(|| EmbeddingError::Backend("empty embedding result".to_string()))
  }

  /// Keyphrase extraction for back-ends that declare the capability.
  async fn extract_keyphrases(
    &self,
    _texts: &[&str],
    _top_k: usize,
  ) -> Result<Vec<Vec<KeyPhrase>>, EmbeddingError> {
    Err(EmbeddingError::NotSupported)
  }

  async fn shutdown(&self) {}
}

/// Model id providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
  /// `cpu:` — local CPU tensor runtime.
  Cpu,
  /// `gpu:` — out-of-process GPU worker.
  Gpu,
}

/// Parse a `provider:model-name` id. Unknown providers fail fast.
pub fn parse_model_id(model_id: &str) -> Result<(Provider, &str), EmbeddingError> {
  let (provider, name) = model_id
    .split_once(':')
    .ok_or_else(|| EmbeddingError::InvalidModelId(model_id.to_string()))?;

  if name.is_empty() {
    return Err(EmbeddingError::InvalidModelId(model_id.to_string()));
  }

  match provider {
    "cpu" => Ok((Provider::Cpu, name)),
    "gpu" => Ok((Provider::Gpu, name)),
    other => Err(EmbeddingError::UnknownProvider(other.to_string())),
  }
}

/// Cosine similarity between two vectors. Zero when either is empty or
/// degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.is_empty() || a.len() != b.len() {
    return 0.0;
  }
  let mut dot = 0.0f32;
  let mut norm_a = 0.0f32;
  let mut norm_b = 0.0f32;
  for (x, y) in a.iter().zip(b.iter()) {
    dot += x * y;
    norm_a += x * x;
    norm_b += y * y;
  }
  let denom = norm_a.sqrt() * norm_b.sqrt();
  if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_model_id() {
    let (provider, name) = parse_model_id("cpu:all-minilm-l6-v2").unwrap();
    assert_eq!(provider, Provider::Cpu);
    assert_eq!(name, "all-minilm-l6-v2");

    let (provider, _) = parse_model_id("gpu:all-mpnet-base-v2").unwrap();
    assert_eq!(provider, Provider::Gpu);
  }

  #[test]
  fn test_parse_model_id_unknown_provider() {
    assert!(matches!(
      parse_model_id("tpu:some-model"),
      Err(EmbeddingError::UnknownProvider(_))
    ));
  }

  #[test]
  fn test_parse_model_id_malformed() {
    assert!(matches!(parse_model_id("no-colon"), Err(EmbeddingError::InvalidModelId(_))));
    assert!(matches!(parse_model_id("cpu:"), Err(EmbeddingError::InvalidModelId(_))));
  }

  #[test]
  fn test_transient_errors() {
    assert!(EmbeddingError::Timeout.is_transient());
    assert!(EmbeddingError::Network("connection reset".to_string()).is_transient());
    assert!(EmbeddingError::Backend("worker returned 503".to_string()).is_transient());
    assert!(!EmbeddingError::Backend("bad input".to_string()).is_transient());
    assert!(!EmbeddingError::NotSupported.is_transient());
    assert!(!EmbeddingError::NotInitialized.is_transient());
    assert!(!EmbeddingError::InvalidModelId("x".to_string()).is_transient());
  }

  #[test]
  fn test_cosine_similarity() {
    assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    assert_eq!(cosine_similarity(&[], &[]), 0.0);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
  }
}
