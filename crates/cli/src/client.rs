//! Client side of the daemon's JSON-lines socket protocol.

use anyhow::{Context, bail};
use daemon::{Request, Response};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct DaemonClient {
  stream: UnixStream,
}

impl DaemonClient {
  /// Connect to a running daemon, if there is one.
  pub async fn connect(socket_path: &Path) -> Option<Self> {
    let stream = UnixStream::connect(socket_path).await.ok()?;
    Some(Self { stream })
  }

  /// Send one request and wait for its response.
  pub async fn call(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
    let request = Request {
      id: Some(Value::from(1)),
      method: method.to_string(),
      params,
    };

    let mut payload = serde_json::to_string(&request)?;
    payload.push('\n');
    self
      .stream
      .write_all(payload.as_bytes())
      .await
      .context("failed to send request to daemon")?;

    let mut reader = BufReader::new(&mut self.stream);
    let mut line = String::new();
    reader
      .read_line(&mut line)
      .await
      .context("failed to read daemon response")?;

    let response: Response = serde_json::from_str(line.trim()).context("malformed daemon response")?;
    if let Some(error) = response.error {
      bail!("daemon error {}: {}", error.code, error.message);
    }
    Ok(response.result.unwrap_or(Value::Null))
  }
}
