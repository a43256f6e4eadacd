//! Daemon lifecycle: startup recovery, background tasks, and shutdown.
//!
//! On start, every configured folder's rows stuck in PROCESSING are
//! reset to PENDING so interrupted work is retried. While running, a
//! periodic task checkpoints the file-state journals, the resource
//! observer samples memory/CPU, and one watcher task per folder feeds
//! incremental file changes into the pipeline.

use embedding::BackendRegistry;
use foldex_core::Config;
use index::{ChangeKind, DebouncedWatcher, FilePipeline, PipelineConfig, Scanner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::folders::FolderRegistry;
use crate::resource::ResourceManager;
use crate::router::Router;
use crate::scheduler::FolderScheduler;
use crate::server::Server;
use crate::tools::ToolHandler;

pub struct Daemon {
  config: Arc<Config>,
  registry: Arc<FolderRegistry>,
  scheduler: Arc<FolderScheduler>,
  tools: Arc<ToolHandler>,
  shutdown: CancellationToken,
}

impl Daemon {
  pub fn new(config: Config) -> Self {
    let config = Arc::new(config);
    let backends = Arc::new(BackendRegistry::new(config.embedding.clone()));
    let registry = Arc::new(FolderRegistry::new(config.clone(), backends));
    let resources = Arc::new(ResourceManager::new(config.scheduler.clone()));
    let scheduler = Arc::new(FolderScheduler::new(config.clone(), registry.clone(), resources));
    let tools = Arc::new(ToolHandler::new(config.clone(), registry.clone(), scheduler.clone()));

    Self {
      config,
      registry,
      scheduler,
      tools,
      shutdown: CancellationToken::new(),
    }
  }

  pub fn scheduler(&self) -> &Arc<FolderScheduler> {
    &self.scheduler
  }

  pub fn tools(&self) -> &Arc<ToolHandler> {
    &self.tools
  }

  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Run the daemon until shutdown (RPC `shutdown`, SIGINT, or token).
  pub async fn run(&self, socket_path: PathBuf) -> Result<(), crate::server::ServerError> {
    let reset = self.registry.recover_configured().await;
    if reset > 0 {
      info!(reset, "Startup recovery reset interrupted files to pending");
    }

    let mut background = Vec::new();
    background.push(self.spawn_observer());
    background.push(self.spawn_checkpointer());
    for folder in &self.config.folders {
      if let Some(task) = self.spawn_watcher(folder.clone()).await {
        background.push(task);
      }
    }

    let router = Arc::new(Router::new(self.tools.clone()));
    let server = Server::new(router.clone(), socket_path);
    let handle = server.shutdown_handle();
    router.set_shutdown_handle(handle.clone()).await;

    {
      let shutdown = self.shutdown.clone();
      let handle = handle.clone();
      tokio::spawn(async move {
        tokio::select! {
          _ = shutdown.cancelled() => handle.shutdown(),
          _ = tokio::signal::ctrl_c() => handle.shutdown(),
        }
      });
    }

    let result = server.run().await;

    // Stop background work and flush state before exiting
    self.shutdown.cancel();
    self.scheduler.cancel_all().await;
    for task in background {
      task.abort();
    }
    self.registry.checkpoint_all().await;
    self.registry.backends().shutdown_all().await;

    result
  }

  fn spawn_observer(&self) -> JoinHandle<()> {
    let resources = self.scheduler.resources().clone();
    let shutdown = self.shutdown.clone();
    tokio::spawn(resources.run_observer(shutdown))
  }

  /// Periodic file-state checkpoint across all open folder stores.
  fn spawn_checkpointer(&self) -> JoinHandle<()> {
    let registry = self.registry.clone();
    let shutdown = self.shutdown.clone();
    let interval = Duration::from_secs(self.config.index.checkpoint_interval_secs.max(1));

    tokio::spawn(async move {
      let mut timer = tokio::time::interval(interval);
      timer.tick().await; // skip the immediate tick
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = timer.tick() => {
            let flushed = registry.checkpoint_all().await;
            if flushed > 0 {
              debug!(flushed, "Periodic checkpoint");
            }
          }
        }
      }
    })
  }

  /// Watch one folder and run incremental updates through the pipeline.
  async fn spawn_watcher(&self, folder: foldex_core::FolderConfig) -> Option<JoinHandle<()>> {
    let resolved = match folder.resolved_path() {
      Ok(p) => p,
      Err(e) => {
        warn!(folder = %folder.path.display(), error = %e, "Not watching unresolvable folder");
        return None;
      }
    };

    let (db, backend) = match self.registry.get_or_open(&folder).await {
      Ok(pair) => pair,
      Err(e) => {
        warn!(folder = %resolved.display(), error = %e, "Not watching folder");
        return None;
      }
    };

    let mut watcher = match DebouncedWatcher::with_defaults(&resolved) {
      Ok(w) => w,
      Err(e) => {
        warn!(folder = %resolved.display(), error = %e, "Watcher failed to start");
        return None;
      }
    };

    let pipeline_config = PipelineConfig::from_configs(&self.config.index, &self.config.embedding, folder.batch_size);
    let pipeline = FilePipeline::new(db.clone(), backend, pipeline_config, self.shutdown.clone())
      .with_throttle(self.scheduler.resources().throttled_flag());
    let scanner = Scanner::new(folder.exclude_globs());
    let shutdown = self.shutdown.clone();

    info!(folder = %resolved.display(), "Watching folder");

    Some(tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let changes = if watcher.overflowing() {
          watcher.flush()
        } else {
          watcher.settled()
        };

        for change in changes {
          let Ok(relative) = change.path.strip_prefix(&resolved) else {
            continue;
          };
          let relative = relative.to_string_lossy().to_string();

          match change.kind {
            ChangeKind::Deleted => {
              debug!(file = %relative, "Watcher: removing deleted file");
              if let Err(e) = db.remove_document(&relative).await {
                warn!(file = %relative, error = %e, "Failed to remove document");
              }
            }
            ChangeKind::Created | ChangeKind::Modified => {
              let Some(fingerprint) = scanner.scan_file(&change.path, &resolved) else {
                continue;
              };
              debug!(file = %relative, "Watcher: reindexing changed file");
              match pipeline.process_file(&resolved, &fingerprint).await {
                Ok(_) => {}
                Err(index::PipelineError::Cancelled) => break,
                Err(e) => warn!(file = %relative, error = %e, "Watcher update failed"),
              }
            }
          }
        }

        if let Err(e) = db.checkpoint().await {
          warn!(error = %e, "Watcher checkpoint failed");
        }
      }
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use foldex_core::{EmbeddingConfig, FolderConfig};
  use tempfile::TempDir;

  fn config_for(dir: &TempDir) -> Config {
    Config {
      folders: vec![FolderConfig::new(dir.path())],
      embedding: EmbeddingConfig {
        model: "cpu:all-minilm-l6-v2".to_string(),
        ..Default::default()
      },
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_daemon_construction() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(config_for(&dir));
    assert!(!daemon.shutdown_token().is_cancelled());
  }

  #[tokio::test]
  async fn test_startup_recovery_resets_processing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.md"), "content").unwrap();

    // Simulate a crash: a row left in PROCESSING
    {
      let db = db::FolderDb::open(dir.path(), 384, "cpu:all-minilm-l6-v2").await.unwrap();
      db.record_file_state(foldex_core::FileState::processing("a.md", "h1", 0))
        .await;
      db.checkpoint().await.unwrap();
    }

    let daemon = Daemon::new(config_for(&dir));
    let reset = daemon.registry.recover_configured().await;
    assert_eq!(reset, 1);
  }
}
