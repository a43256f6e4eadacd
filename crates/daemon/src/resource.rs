//! Resource-aware admission control and throttling.
//!
//! Every folder job reserves an estimated memory cost before running.
//! Admission is refused when running jobs plus the new estimate would
//! exceed the ceiling; refused jobs wait in a bounded queue. A periodic
//! observer samples memory and CPU and raises a throttle signal that
//! pipelines consume to shrink their batch sizes. Throttling pauses
//! admission but never blocks in-flight writes.

use foldex_core::SchedulerConfig;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AdmitError {
  #[error("Admission queue is full")]
  QueueFull,
  #[error("Cancelled while waiting for admission")]
  Cancelled,
}

/// Emitted when the observer crosses a high-water mark.
#[derive(Debug, Clone)]
pub enum ThrottleEvent {
  Throttled { memory_mb: u64, cpu_pct: f32 },
  Resumed,
}

#[derive(Debug, Default)]
struct ResourceState {
  active_jobs: usize,
  reserved_mb: u64,
  queued: usize,
}

/// Reservation held by an admitted job; must be given back via
/// [`ResourceManager::release`].
#[derive(Debug)]
pub struct Permit {
  estimated_mb: u64,
}

impl Permit {
  pub fn estimated_mb(&self) -> u64 {
    self.estimated_mb
  }
}

/// Global counters (active jobs, memory reservations, throttle flag)
/// under a single lock.
pub struct ResourceManager {
  limits: SchedulerConfig,
  state: Mutex<ResourceState>,
  throttled: Arc<AtomicBool>,
  throttle_tx: broadcast::Sender<ThrottleEvent>,
  wakeup: Notify,
}

impl ResourceManager {
  pub fn new(limits: SchedulerConfig) -> Self {
    let (throttle_tx, _) = broadcast::channel(16);
    Self {
      limits,
      state: Mutex::new(ResourceState::default()),
      throttled: Arc::new(AtomicBool::new(false)),
      throttle_tx,
      wakeup: Notify::new(),
    }
  }

  /// Shared flag pipelines poll to shrink their effective batch size.
  pub fn throttled_flag(&self) -> Arc<AtomicBool> {
    self.throttled.clone()
  }

  pub fn is_throttled(&self) -> bool {
    self.throttled.load(Ordering::Relaxed)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ThrottleEvent> {
    self.throttle_tx.subscribe()
  }

  /// Admit a job with an estimated memory cost, waiting in the queue if
  /// capacity is unavailable. Fails fast when the queue itself is full.
  pub async fn admit(&self, estimated_mb: u64, cancel: &CancellationToken) -> Result<Permit, AdmitError> {
    let mut queued_here = false;

    loop {
      {
        let mut state = self.state.lock().await;

        let has_capacity = state.active_jobs < self.limits.max_concurrent_folders
          && state.reserved_mb + estimated_mb <= self.limits.memory_limit_mb
          && !self.is_throttled();

        if has_capacity {
          if queued_here {
            state.queued -= 1;
          }
          state.active_jobs += 1;
          state.reserved_mb += estimated_mb;
          debug!(
            active = state.active_jobs,
            reserved_mb = state.reserved_mb,
            "Job admitted"
          );
          return Ok(Permit { estimated_mb });
        }

        if !queued_here {
          if state.queued >= self.limits.queue_capacity {
            return Err(AdmitError::QueueFull);
          }
          state.queued += 1;
          queued_here = true;
        }
      }

      // The sleep arm covers a wakeup racing ahead of this waiter
      tokio::select! {
        _ = cancel.cancelled() => {
          let mut state = self.state.lock().await;
          state.queued -= 1;
          return Err(AdmitError::Cancelled);
        }
        _ = self.wakeup.notified() => {}
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
      }
    }
  }

  /// Return a permit's reservation and wake queued jobs.
  pub async fn release(&self, permit: Permit) {
    let mut state = self.state.lock().await;
    state.active_jobs = state.active_jobs.saturating_sub(1);
    state.reserved_mb = state.reserved_mb.saturating_sub(permit.estimated_mb);
    drop(state);
    self.wakeup.notify_waiters();
  }

  pub async fn active_jobs(&self) -> usize {
    self.state.lock().await.active_jobs
  }

  pub async fn queued_jobs(&self) -> usize {
    self.state.lock().await.queued
  }

  /// Run the memory/CPU observer until shutdown. Emits [`ThrottleEvent`]
  /// transitions and pauses admission while above the high-water marks.
  pub async fn run_observer(self: Arc<Self>, shutdown: CancellationToken) {
    let mut system = System::new();
    let interval = Duration::from_secs(self.limits.sample_interval_secs.max(1));
    let memory_high_water =
      (self.limits.memory_limit_mb as f64 * (self.limits.throttle_memory_pct as f64 / 100.0)) as u64;

    info!(
      memory_high_water_mb = memory_high_water,
      cpu_pct = self.limits.throttle_cpu_pct,
      "Resource observer started"
    );

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = tokio::time::sleep(interval) => {}
      }

      system.refresh_memory();
      system.refresh_cpu_usage();
      let used_mb = system.used_memory() / (1024 * 1024);
      let cpu_pct = system.global_cpu_usage();

      let over = used_mb > memory_high_water || cpu_pct > self.limits.throttle_cpu_pct;
      let was = self.throttled.swap(over, Ordering::Relaxed);

      if over && !was {
        warn!(used_mb, cpu_pct, "Resource pressure: throttling");
        let _ = self.throttle_tx.send(ThrottleEvent::Throttled {
          memory_mb: used_mb,
          cpu_pct,
        });
      } else if !over && was {
        info!("Resource pressure cleared");
        let _ = self.throttle_tx.send(ThrottleEvent::Resumed);
        self.wakeup.notify_waiters();
      }
    }
  }
}

/// Estimated memory cost of indexing a folder: a quarter of its on-disk
/// size, clamped to [64, 1024] MiB. Corrected after the scan completes.
pub fn estimate_memory_mb(folder: &Path) -> u64 {
  let bytes = dir_size(folder, 0);
  ((bytes / 4) / (1024 * 1024)).clamp(64, 1024)
}

fn dir_size(path: &Path, depth: usize) -> u64 {
  if depth > 6 {
    return 0;
  }
  let Ok(entries) = std::fs::read_dir(path) else {
    return 0;
  };

  let mut total = 0u64;
  for entry in entries.flatten() {
    let Ok(metadata) = entry.metadata() else { continue };
    if metadata.is_file() {
      total += metadata.len();
    } else if metadata.is_dir() && entry.file_name() != foldex_core::CACHE_DIR_NAME {
      total += dir_size(&entry.path(), depth + 1);
    }
  }
  total
}

#[cfg(test)]
mod tests {
  use super::*;

  fn limits(max_jobs: usize, memory_mb: u64, queue: usize) -> SchedulerConfig {
    SchedulerConfig {
      max_concurrent_folders: max_jobs,
      memory_limit_mb: memory_mb,
      queue_capacity: queue,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_admit_and_release() {
    let manager = ResourceManager::new(limits(2, 1000, 4));
    let cancel = CancellationToken::new();

    let p1 = manager.admit(100, &cancel).await.unwrap();
    let p2 = manager.admit(100, &cancel).await.unwrap();
    assert_eq!(manager.active_jobs().await, 2);

    manager.release(p1).await;
    manager.release(p2).await;
    assert_eq!(manager.active_jobs().await, 0);
  }

  #[tokio::test]
  async fn test_queue_full() {
    let manager = Arc::new(ResourceManager::new(limits(1, 1000, 0)));
    let cancel = CancellationToken::new();

    let _p1 = manager.admit(100, &cancel).await.unwrap();
    // No queue slots: immediate refusal
    assert!(matches!(manager.admit(100, &cancel).await, Err(AdmitError::QueueFull)));
  }

  #[tokio::test]
  async fn test_queued_job_admitted_after_release() {
    let manager = Arc::new(ResourceManager::new(limits(1, 1000, 4)));
    let cancel = CancellationToken::new();

    let p1 = manager.admit(100, &cancel).await.unwrap();

    let waiter = {
      let manager = manager.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { manager.admit(100, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.queued_jobs().await, 1);

    manager.release(p1).await;
    let permit = waiter.await.unwrap().unwrap();
    assert_eq!(permit.estimated_mb(), 100);
  }

  #[tokio::test]
  async fn test_memory_ceiling_blocks() {
    let manager = Arc::new(ResourceManager::new(limits(4, 300, 4)));
    let cancel = CancellationToken::new();

    let _p1 = manager.admit(200, &cancel).await.unwrap();

    // 200 + 200 > 300: must queue rather than admit
    let waiter = {
      let manager = manager.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { manager.admit(200, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    cancel.cancel();
    assert!(matches!(waiter.await.unwrap(), Err(AdmitError::Cancelled)));
  }

  #[tokio::test]
  async fn test_cancel_while_queued() {
    let manager = Arc::new(ResourceManager::new(limits(1, 1000, 4)));
    let cancel = CancellationToken::new();

    let _p1 = manager.admit(100, &cancel).await.unwrap();

    let job_cancel = CancellationToken::new();
    let waiter = {
      let manager = manager.clone();
      let job_cancel = job_cancel.clone();
      tokio::spawn(async move { manager.admit(100, &job_cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    job_cancel.cancel();
    assert!(matches!(waiter.await.unwrap(), Err(AdmitError::Cancelled)));
    assert_eq!(manager.queued_jobs().await, 0);
  }

  #[test]
  fn test_estimate_clamped() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("small.txt"), "tiny").unwrap();
    assert_eq!(estimate_memory_mb(dir.path()), 64);
  }
}
