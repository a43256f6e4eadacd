use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::server::ShutdownHandle;
use crate::tools::{Envelope, ToolHandler};

/// JSON-RPC style request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  #[serde(default)]
  pub id: Option<serde_json::Value>,
  pub method: String,
  #[serde(default)]
  pub params: serde_json::Value,
}

/// JSON-RPC style response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
  pub code: i32,
  pub message: String,
}

impl Response {
  pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
    Self {
      id,
      result: Some(result),
      error: None,
    }
  }

  pub fn error(id: Option<serde_json::Value>, code: i32, message: &str) -> Self {
    Self {
      id,
      result: None,
      error: Some(RpcError {
        code,
        message: message.to_string(),
      }),
    }
  }

  fn from_envelope(id: Option<serde_json::Value>, envelope: Envelope) -> Self {
    // Tool errors still travel as results so callers get the envelope
    Self::success(id, serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null))
  }
}

/// Request router for the daemon.
pub struct Router {
  tools: Arc<ToolHandler>,
  shutdown_handle: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl Router {
  pub fn new(tools: Arc<ToolHandler>) -> Self {
    Self {
      tools,
      shutdown_handle: Arc::new(Mutex::new(None)),
    }
  }

  /// Set the shutdown handle (called after the server is created).
  pub async fn set_shutdown_handle(&self, handle: ShutdownHandle) {
    let mut guard = self.shutdown_handle.lock().await;
    *guard = Some(handle);
  }

  /// Handle an incoming request.
  pub async fn handle(&self, request: Request) -> Response {
    debug!("Handling request: {}", request.method);
    let Request { id, method, params } = request;

    match method.as_str() {
      "ping" => Response::success(id, serde_json::json!("pong")),
      "shutdown" => self.handle_shutdown(id).await,

      // Query surface
      "search" => Response::from_envelope(id, self.tools.search(params).await),
      "list_folders" => Response::from_envelope(id, self.tools.list_folders().await),
      "list_documents" => Response::from_envelope(id, self.tools.list_documents(params).await),
      "document_outline" => Response::from_envelope(id, self.tools.document_outline(params).await),
      "document_data" => Response::from_envelope(id, self.tools.document_data(params).await),
      "sheet_data" => Response::from_envelope(id, self.tools.sheet_data(params).await),
      "slides" => Response::from_envelope(id, self.tools.slides(params).await),
      "pages" => Response::from_envelope(id, self.tools.pages(params).await),
      "embedding" => Response::from_envelope(id, self.tools.embedding(params).await),
      "status" => Response::from_envelope(id, self.tools.status(params).await),

      // Indexing controls
      "index" => Response::from_envelope(id, self.tools.index_folders(params).await),
      "cancel" => Response::from_envelope(id, self.tools.cancel(params).await),

      _ => {
        warn!("Unknown method: {}", method);
        Response::error(id, -32601, &format!("Method not found: {method}"))
      }
    }
  }

  async fn handle_shutdown(&self, id: Option<serde_json::Value>) -> Response {
    info!("Shutdown requested via RPC");
    let guard = self.shutdown_handle.lock().await;
    if let Some(handle) = guard.as_ref() {
      handle.shutdown();
      Response::success(id, serde_json::json!({"status": "shutting_down"}))
    } else {
      Response::error(id, -32000, "Shutdown handle not available")
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_response_success() {
    let response = Response::success(Some(serde_json::json!(1)), serde_json::json!("test"));
    assert!(response.result.is_some());
    assert!(response.error.is_none());
  }

  #[test]
  fn test_response_error() {
    let response = Response::error(Some(serde_json::json!(1)), -1, "test error");
    assert!(response.result.is_none());
    assert_eq!(response.error.as_ref().unwrap().code, -1);
  }

  #[test]
  fn test_request_parses_without_id() {
    let request: Request = serde_json::from_str(r#"{"method": "ping"}"#).unwrap();
    assert!(request.id.is_none());
    assert_eq!(request.method, "ping");
    assert!(request.params.is_null());
  }
}
