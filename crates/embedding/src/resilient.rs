//! Retry wrapper for embedding back-ends.
//!
//! The retry schedule is derived from the wrapped back-end's declared
//! service kind: the in-process tensor runtime gets a single quick
//! second chance (its failures are usually deterministic), while the
//! shared worker process gets a fuller schedule since its faults tend
//! to be load spikes or a restart in progress. Every call also carries
//! a deadline; a call that outlives it is reported as a timeout, which
//! the pipeline treats as a batch failure with partial progress.

use async_trait::async_trait;
use foldex_core::KeyPhrase;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::provider::{
  Capabilities, EmbeddingBackend, EmbeddingError, EmbeddingVector, Lifecycle, ServiceKind,
};

/// Pauses between retries for an in-process back-end.
const LOCAL_SCHEDULE: &[Duration] = &[Duration::from_millis(200)];

/// Pauses between retries for the shared worker process.
const WORKER_SCHEDULE: &[Duration] = &[
  Duration::from_millis(500),
  Duration::from_secs(2),
  Duration::from_secs(8),
];

/// Retry schedule plus per-call deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  schedule: &'static [Duration],
  call_deadline: Duration,
  staggered: bool,
}

impl RetryPolicy {
  /// Policy appropriate for a back-end's service kind.
  pub fn for_kind(kind: ServiceKind, call_deadline: Duration) -> Self {
    match kind {
      ServiceKind::LocalTensor => Self {
        schedule: LOCAL_SCHEDULE,
        call_deadline,
        staggered: false,
      },
      // Staggered so several folders retrying against one worker do not
      // all land on the same instant
      ServiceKind::RemoteWorker => Self {
        schedule: WORKER_SCHEDULE,
        call_deadline,
        staggered: true,
      },
    }
  }

  /// Explicit schedule, mainly for tests.
  pub fn fixed(schedule: &'static [Duration], call_deadline: Duration) -> Self {
    Self {
      schedule,
      call_deadline,
      staggered: false,
    }
  }

  pub fn call_deadline(&self) -> Duration {
    self.call_deadline
  }

  pub fn max_retries(&self) -> usize {
    self.schedule.len()
  }

  /// Pause before the given retry, or `None` when the schedule is
  /// exhausted.
  fn pause_before(&self, retry: usize) -> Option<Duration> {
    let base = *self.schedule.get(retry)?;
    Some(if self.staggered { stagger(base) } else { base })
  }
}

/// Stretch a pause by up to 20%, seeded from the process hasher so
/// concurrent retriers spread out without an RNG dependency.
fn stagger(base: Duration) -> Duration {
  let sample = RandomState::new().hash_one(std::process::id());
  let fraction = (sample % 200) as f64 / 1000.0;
  base.mul_f64(1.0 + fraction)
}

/// Wraps a back-end with deadline and retry behavior.
pub struct Resilient<B> {
  inner: B,
  policy: RetryPolicy,
}

impl<B: EmbeddingBackend> Resilient<B> {
  pub fn new(inner: B, policy: RetryPolicy) -> Self {
    Self { inner, policy }
  }

  async fn drive<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, EmbeddingError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EmbeddingError>>,
  {
    let mut retry = 0;

    loop {
      let error = match tokio::time::timeout(self.policy.call_deadline, call()).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) if e.is_transient() => e,
        Ok(Err(e)) => return Err(e),
        Err(_) => EmbeddingError::Timeout,
      };

      let Some(pause) = self.policy.pause_before(retry) else {
        return Err(error);
      };
      retry += 1;
      warn!(what, retry, ?pause, error = %error, "Transient backend fault, retrying");
      sleep(pause).await;
    }
  }
}

#[async_trait]
impl<B: EmbeddingBackend> EmbeddingBackend for Resilient<B> {
  fn model_id(&self) -> &str {
    self.inner.model_id()
  }

  fn dimensions(&self) -> usize {
    self.inner.dimensions()
  }

  fn capabilities(&self) -> Capabilities {
    self.inner.capabilities()
  }

  fn lifecycle(&self) -> Lifecycle {
    self.inner.lifecycle()
  }

  async fn initialize(&self) -> Result<(), EmbeddingError> {
    // The registry bounds initialization with its own timeout
    self.inner.initialize().await
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Option<EmbeddingVector>>, EmbeddingError> {
    self.drive("embed_batch", || self.inner.embed_batch(texts)).await
  }

  async fn embed_query(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
    self.drive("embed_query", || self.inner.embed_query(text)).await
  }

  async fn extract_keyphrases(
    &self,
    texts: &[&str],
    top_k: usize,
  ) -> Result<Vec<Vec<KeyPhrase>>, EmbeddingError> {
    self
      .drive("extract_keyphrases", || self.inner.extract_keyphrases(texts, top_k))
      .await
  }

  async fn shutdown(&self) {
    self.inner.shutdown().await
  }
}
