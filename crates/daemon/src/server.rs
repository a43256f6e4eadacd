//! JSON-lines RPC server over a Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::router::{Request, Response, Router};

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

/// Default socket path: runtime dir when available, /tmp otherwise.
pub fn default_socket_path() -> PathBuf {
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(runtime_dir).join("foldex.sock")
  } else {
    #[cfg(unix)]
    let uid = unsafe { libc::getuid() };
    #[cfg(not(unix))]
    let uid = 0;
    PathBuf::from(format!("/tmp/foldex-{uid}.sock"))
  }
}

/// Handle to signal server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
  tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
  pub fn shutdown(&self) {
    let _ = self.tx.send(());
  }
}

/// Unix socket server for the daemon.
pub struct Server {
  socket_path: PathBuf,
  router: Arc<Router>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Server {
  pub fn new(router: Arc<Router>, socket_path: PathBuf) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      socket_path,
      router,
      shutdown_tx,
    }
  }

  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle {
      tx: self.shutdown_tx.clone(),
    }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Run the accept loop until a shutdown signal arrives.
  pub async fn run(&self) -> Result<(), ServerError> {
    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    if let Some(parent) = self.socket_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&self.socket_path)?;
    info!("Daemon listening on {:?}", self.socket_path);

    let mut shutdown_rx = self.shutdown_tx.subscribe();

    loop {
      tokio::select! {
        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let router = Arc::clone(&self.router);
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, router).await {
                  error!("Connection error: {}", e);
                }
              });
            }
            Err(e) => {
              error!("Accept error: {}", e);
            }
          }
        }
        _ = shutdown_rx.recv() => {
          info!("Shutdown signal received");
          break;
        }
      }
    }

    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    Ok(())
  }
}

async fn handle_connection(stream: UnixStream, router: Arc<Router>) -> Result<(), ServerError> {
  let (reader, mut writer) = stream.into_split();
  let mut reader = BufReader::new(reader);
  let mut line = String::new();

  loop {
    line.clear();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      debug!("Client disconnected");
      break;
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<Request>(trimmed) {
      Ok(request) => router.handle(request).await,
      Err(e) => Response::error(None, -32700, &format!("Parse error: {e}")),
    };

    let mut payload = serde_json::to_string(&response)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_socket_path_is_absolute() {
    assert!(default_socket_path().is_absolute());
  }
}
