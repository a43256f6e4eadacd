//! Out-of-process GPU worker back-end.
//!
//! The worker is a sentence-transformers process reachable over HTTP.
//! It may still be starting when the daemon comes up, so availability is
//! probed with bounded retries during initialization. The worker also
//! serves a keyphrase API, which the pipeline uses instead of the n-gram
//! strategy for chunks embedded here.

use async_trait::async_trait;
use foldex_core::KeyPhrase;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::provider::{
  Capabilities, EmbeddingBackend, EmbeddingError, EmbeddingVector, Lifecycle, ServiceKind,
};

/// Availability probe attempts during initialization.
const PROBE_ATTEMPTS: u32 = 5;
/// Delay between probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_SHUTTING_DOWN: u8 = 3;
const STATE_TERMINATED: u8 = 4;

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
  model: &'a str,
  num_threads: usize,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
  dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
  model: &'a str,
  texts: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedItem {
  index: usize,
  vector: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
  embeddings: Vec<EmbedItem>,
}

#[derive(Debug, Serialize)]
struct KeyphraseRequest<'a> {
  model: &'a str,
  texts: &'a [&'a str],
  top_k: usize,
}

#[derive(Debug, Deserialize)]
struct KeyphraseItem {
  text: String,
  score: f32,
}

#[derive(Debug, Deserialize)]
struct KeyphraseResponse {
  keyphrases: Vec<Vec<KeyphraseItem>>,
}

/// Remote GPU worker back-end, shared as a singleton per model id.
///
/// In-flight requests are bounded by the worker pool size so the shared
/// process is not flooded when several folders index at once.
pub struct WorkerBackend {
  model_id: String,
  model_name: String,
  base_url: String,
  num_threads: usize,
  client: reqwest::Client,
  dimensions: AtomicUsize,
  state: AtomicU8,
  pool: Semaphore,
}

impl WorkerBackend {
  pub fn new(model_id: &str, model_name: &str, base_url: &str, pool_size: usize, num_threads: usize) -> Self {
    Self {
      model_id: model_id.to_string(),
      model_name: model_name.to_string(),
      base_url: base_url.trim_end_matches('/').to_string(),
      num_threads,
      client: reqwest::Client::new(),
      dimensions: AtomicUsize::new(0),
      state: AtomicU8::new(STATE_UNINITIALIZED),
      pool: Semaphore::new(pool_size.max(1)),
    }
  }

  async fn probe_health(&self) -> bool {
    match self.client.get(format!("{}/health", self.base_url)).send().await {
      Ok(resp) => resp.status().is_success(),
      Err(_) => false,
    }
  }
}

#[async_trait]
impl EmbeddingBackend for WorkerBackend {
  fn model_id(&self) -> &str {
    &self.model_id
  }

  fn dimensions(&self) -> usize {
    self.dimensions.load(Ordering::Acquire)
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      can_embed: true,
      can_extract_keyphrases: true,
      service_kind: ServiceKind::RemoteWorker,
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

    // The worker process may still be loading its runtime
    let mut available = false;
    for attempt in 1..=PROBE_ATTEMPTS {
      if self.probe_health().await {
        available = true;
        break;
      }
      debug!(attempt, "Worker not ready, retrying");
      if attempt < PROBE_ATTEMPTS {
        sleep(PROBE_INTERVAL).await;
      }
    }
    if !available {
      self.state.store(STATE_UNINITIALIZED, Ordering::Release);
      return Err(EmbeddingError::NotAvailable);
    }

    let response = self
      .client
      .post(format!("{}/models/load", self.base_url))
      .json(&LoadRequest {
        model: &self.model_name,
        num_threads: self.num_threads,
      })
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      self.state.store(STATE_UNINITIALIZED, Ordering::Release);
      return Err(EmbeddingError::Backend(format!("model load failed: {status}")));
    }

    let loaded: LoadResponse = response.json().await?;
    self.dimensions.store(loaded.dimensions, Ordering::Release);
    self.state.store(STATE_READY, Ordering::Release);
    debug!(model = %self.model_id, dims = loaded.dimensions, "Worker backend ready");
    Ok(())
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError> {
    if !self.is_initialized() {
      return Err(EmbeddingError::NotInitialized);
    }
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let _slot = self.pool.acquire().await.map_err(|_| EmbeddingError::NotAvailable)?;
    let response = self
      .client
      .post(format!("{}/embed", self.base_url))
      .json(&EmbedRequest {
        model: &self.model_name,
        texts,
      })
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(EmbeddingError::Backend(format!("embed failed: {}", response.status())));
    }

    let body: EmbedResponse = response.json().await?;

    // Positional alignment: the worker reports indices of the texts it
    // embedded; missing indices are batch-local failures.
    let mut results: Vec<Option<EmbeddingVector>> = vec![None; texts.len()];
    for item in body.embeddings {
      if item.index < results.len() {
        results[item.index] = Some(EmbeddingVector::new(item.vector, &self.model_id));
      } else {
        warn!(index = item.index, "Worker returned out-of-range embedding index");
      }
    }
    Ok(results)
  }

  async fn extract_keyphrases(
    &self,
    texts: &[&str],
    top_k: usize,
  ) -> Result<Vec<Vec<KeyPhrase>>, EmbeddingError> {
    if !self.is_initialized() {
      return Err(EmbeddingError::NotInitialized);
    }
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let _slot = self.pool.acquire().await.map_err(|_| EmbeddingError::NotAvailable)?;
    let response = self
      .client
      .post(format!("{}/keyphrases", self.base_url))
      .json(&KeyphraseRequest {
        model: &self.model_name,
        texts,
        top_k,
      })
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(EmbeddingError::Backend(format!(
        "keyphrase extraction failed: {}",
        response.status()
      )));
    }

    let body: KeyphraseResponse = response.json().await?;
    Ok(
      body
        .keyphrases
        .into_iter()
        .map(|phrases| {
          phrases
            .into_iter()
            .map(|p| KeyPhrase {
              text: p.text,
              score: p.score,
            })
            .collect()
        })
        .collect(),
    )
  }

  async fn shutdown(&self) {
    self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
    let _ = self
      .client
      .post(format!("{}/models/unload", self.base_url))
      .json(&serde_json::json!({ "model": self.model_name }))
      .send()
      .await;
    self.state.store(STATE_TERMINATED, Ordering::Release);
  }
}
