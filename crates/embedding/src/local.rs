//! In-process CPU tensor back-end.
//!
//! Embeds by hashed bag-of-features projection: words and character
//! trigrams hash into a fixed number of buckets, accumulate TF-damped
//! weights, and the result is L2-normalized. Deterministic, so tests and
//! re-runs produce identical vectors for identical text.

use async_trait::async_trait;
use foldex_core::model_cache_dir;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

use crate::provider::{
  Capabilities, EmbeddingBackend, EmbeddingError, EmbeddingVector, Lifecycle, ServiceKind,
};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_SHUTTING_DOWN: u8 = 3;
const STATE_TERMINATED: u8 = 4;

/// Local CPU embedding back-end. No keyphrase capability; the pipeline
/// pairs it with the n-gram + cosine extraction strategy.
pub struct LocalTensorBackend {
  model_id: String,
  dimensions: usize,
  cache_dir: PathBuf,
  state: AtomicU8,
}

impl LocalTensorBackend {
  pub fn new(model_id: &str, model_name: &str) -> Self {
    Self {
      model_id: model_id.to_string(),
      dimensions: dimensions_for(model_name),
      cache_dir: model_cache_dir().join(model_name),
      state: AtomicU8::new(STATE_UNINITIALIZED),
    }
  }

  pub fn with_dimensions(mut self, dimensions: usize) -> Self {
    self.dimensions = dimensions;
    self
  }

  pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
    self.cache_dir = cache_dir;
    self
  }

  fn embed_text(&self, text: &str) -> Vec<f32> {
    let mut buckets = vec![0.0f32; self.dimensions];

    let lowered = text.to_lowercase();
    for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
      bump(&mut buckets, word, 0x57, 1.0);

      // Character trigrams soften exact-word dependence
      let chars: Vec<char> = word.chars().collect();
      for window in chars.windows(3) {
        let trigram: String = window.iter().collect();
        bump(&mut buckets, &trigram, 0x3a, 0.5);
      }
    }

    let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
      for v in &mut buckets {
        *v /= norm;
      }
    }
    buckets
  }
}

fn bump(buckets: &mut [f32], token: &str, seed: u8, weight: f32) {
  let mut hasher = DefaultHasher::new();
  seed.hash(&mut hasher);
  token.hash(&mut hasher);
  let hash = hasher.finish();
  let index = (hash % buckets.len() as u64) as usize;
  // Sign bit from a higher hash bit keeps the projection balanced
  let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
  buckets[index] += sign * weight;
}

/// Known model dimensions; unknown models get the MiniLM default.
fn dimensions_for(model_name: &str) -> usize {
  match model_name {
    "all-minilm-l6-v2" => 384,
    "all-mpnet-base-v2" => 768,
    "bge-small-en-v1.5" => 384,
    "bge-base-en-v1.5" => 768,
    _ => 384,
  }
}

#[async_trait]
impl EmbeddingBackend for LocalTensorBackend {
  fn model_id(&self) -> &str {
    &self.model_id
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      can_embed: true,
      can_extract_keyphrases: false,
      service_kind: ServiceKind::LocalTensor,
    }
  }

  fn lifecycle(&self) -> Lifecycle {
    match self.state.load(Ordering::Acquire) {
      STATE_INITIALIZING => Lifecycle::Initializing,
      STATE_READY => Lifecycle::Ready,
      STATE_SHUTTING_DOWN => Lifecycle::ShuttingDown,
      STATE_TERMINATED => Lifecycle::Terminated,
      _ => Lifecycle::Uninitialized,
    }
  }

  async fn initialize(&self) -> Result<(), EmbeddingError> {
    self.state.store(STATE_INITIALIZING, Ordering::Release);

    std::fs::create_dir_all(&self.cache_dir)
      .map_err(|e| EmbeddingError::Backend(format!("model cache dir: {e}")))?;

    debug!(model = %self.model_id, dims = self.dimensions, "Local tensor backend ready");
    self.state.store(STATE_READY, Ordering::Release);
    Ok(())
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError> {
    if !self.is_initialized() {
      return Err(EmbeddingError::NotInitialized);
    }

    Ok(
      texts
        .iter()
        .map(|text| Some(EmbeddingVector::new(self.embed_text(text), &self.model_id)))
        .collect(),
    )
  }

  async fn shutdown(&self) {
    self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
    self.state.store(STATE_TERMINATED, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::cosine_similarity;

  async fn backend() -> LocalTensorBackend {
    let dir = tempfile::TempDir::new().unwrap();
    let backend =
      LocalTensorBackend::new("cpu:all-minilm-l6-v2", "all-minilm-l6-v2").with_cache_dir(dir.keep());
    backend.initialize().await.unwrap();
    backend
  }

  #[tokio::test]
  async fn test_requires_initialize() {
    let backend = LocalTensorBackend::new("cpu:all-minilm-l6-v2", "all-minilm-l6-v2");
    assert!(!backend.is_initialized());
    assert!(matches!(
      backend.embed_batch(&["x"]).await,
      Err(EmbeddingError::NotInitialized)
    ));
  }

  #[tokio::test]
  async fn test_deterministic_embeddings() {
    let backend = backend().await;
    let a = backend.embed_query("the quarterly report").await.unwrap();
    let b = backend.embed_query("the quarterly report").await.unwrap();
    assert_eq!(a.vector, b.vector);
    assert_eq!(a.dim, 384);
  }

  #[tokio::test]
  async fn test_similar_text_scores_higher() {
    let backend = backend().await;
    let report = backend.embed_query("quarterly financial report revenue").await.unwrap();
    let related = backend.embed_query("revenue report for the quarter").await.unwrap();
    let unrelated = backend.embed_query("zebra migration patterns savanna").await.unwrap();

    let close = cosine_similarity(&report.vector, &related.vector);
    let far = cosine_similarity(&report.vector, &unrelated.vector);
    assert!(close > far, "related {close} should beat unrelated {far}");
  }

  #[tokio::test]
  async fn test_vectors_normalized() {
    let backend = backend().await;
    let v = backend.embed_query("some text to embed").await.unwrap();
    let norm: f32 = v.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }

  #[tokio::test]
  async fn test_no_keyphrase_capability() {
    let backend = backend().await;
    assert!(!backend.capabilities().can_extract_keyphrases);
    assert!(matches!(
      backend.extract_keyphrases(&["x"], 5).await,
      Err(EmbeddingError::NotSupported)
    ));
  }
}
