//! Model-keyed back-end registry.
//!
//! Back-ends are shared across folders with the same model id. Creation
//! is single-writer: concurrent first-calls for one model await the same
//! in-flight initialization instead of constructing duplicates.

use foldex_core::EmbeddingConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::local::LocalTensorBackend;
use crate::provider::{EmbeddingBackend, EmbeddingError, Provider, parse_model_id};
use crate::resilient::{Resilient, RetryPolicy};
use crate::worker::WorkerBackend;

type SharedBackend = Arc<dyn EmbeddingBackend>;

pub struct BackendRegistry {
  config: EmbeddingConfig,
  cells: Mutex<HashMap<String, Arc<OnceCell<SharedBackend>>>>,
}

impl BackendRegistry {
  pub fn new(config: EmbeddingConfig) -> Self {
    Self {
      config,
      cells: Mutex::new(HashMap::new()),
    }
  }

  /// Get the shared back-end for a model id, creating and initializing
  /// it on first use.
  pub async fn get_or_create(&self, model_id: &str) -> Result<SharedBackend, EmbeddingError> {
    // Fail fast on malformed ids before touching the cache
    parse_model_id(model_id)?;

    let cell = {
      let mut cells = self.cells.lock().await;
      cells
        .entry(model_id.to_string())
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone()
    };

    // Coalesced: OnceCell runs one init; other callers await it
    let backend = cell
      .get_or_try_init(|| async { self.build(model_id).await })
      .await?;

    Ok(backend.clone())
  }

  async fn build(&self, model_id: &str) -> Result<SharedBackend, EmbeddingError> {
    let (provider, model_name) = parse_model_id(model_id)?;
    let call_deadline = std::time::Duration::from_secs(self.config.batch_timeout_secs);

    let backend: SharedBackend = match provider {
      Provider::Cpu => {
        let inner = LocalTensorBackend::new(model_id, model_name);
        let policy = RetryPolicy::for_kind(inner.service_kind(), call_deadline);
        Arc::new(Resilient::new(inner, policy))
      }
      Provider::Gpu => {
        let inner = WorkerBackend::new(
          model_id,
          model_name,
          &self.config.worker_url,
          self.config.worker_pool_size,
          self.config.num_threads,
        );
        let policy = RetryPolicy::for_kind(inner.service_kind(), call_deadline);
        Arc::new(Resilient::new(inner, policy))
      }
    };

    info!(model = model_id, "Initializing embedding backend");
    tokio::time::timeout(
      std::time::Duration::from_secs(self.config.init_timeout_secs),
      backend.initialize(),
    )
    .await
    .map_err(|_| EmbeddingError::Timeout)??;

    Ok(backend)
  }

  /// Back-ends currently alive in the registry.
  pub async fn loaded_models(&self) -> Vec<String> {
    let cells = self.cells.lock().await;
    cells
      .iter()
      .filter(|(_, cell)| cell.initialized())
      .map(|(id, _)| id.clone())
      .collect()
  }

  /// Shut down every initialized back-end.
  pub async fn shutdown_all(&self) {
    let cells = self.cells.lock().await;
    for cell in cells.values() {
      if let Some(backend) = cell.get() {
        backend.shutdown().await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_config() -> EmbeddingConfig {
    EmbeddingConfig {
      model: "cpu:all-minilm-l6-v2".to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_unknown_provider_fails_fast() {
    let registry = BackendRegistry::new(test_config());
    assert!(matches!(
      registry.get_or_create("npu:model").await,
      Err(EmbeddingError::UnknownProvider(_))
    ));
  }

  #[tokio::test]
  async fn test_shared_instance_per_model() {
    let registry = BackendRegistry::new(test_config());

    let a = registry.get_or_create("cpu:all-minilm-l6-v2").await.unwrap();
    let b = registry.get_or_create("cpu:all-minilm-l6-v2").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[tokio::test]
  async fn test_concurrent_first_calls_coalesce() {
    let registry = Arc::new(BackendRegistry::new(test_config()));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let registry = registry.clone();
      handles.push(tokio::spawn(async move {
        registry.get_or_create("cpu:all-minilm-l6-v2").await.unwrap()
      }));
    }

    let mut backends = Vec::new();
    for handle in handles {
      backends.push(handle.await.unwrap());
    }
    for pair in backends.windows(2) {
      assert!(Arc::ptr_eq(&pair[0], &pair[1]));
    }
    assert_eq!(registry.loaded_models().await.len(), 1);
  }
}
