//! Query-surface tool handlers.
//!
//! Every tool returns the standard envelope `{data, status,
//! continuation, actions}`; long document reads paginate by a token
//! budget with an opaque continuation token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use db::{FolderDb, SearchOptions};
use foldex_core::{Config, ExtractionParams, FileType, FolderConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::folders::FolderRegistry;
use crate::scheduler::{FolderScheduler, IndexOptions};

/// Default token budget for paginated document reads.
const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Standard response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub data: Value,
  pub status: Status,
  pub continuation: Continuation,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub actions: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
  pub code: String,
  pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Continuation {
  pub has_more: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub token: Option<String>,
}

impl Envelope {
  pub fn success(data: Value) -> Self {
    Self {
      data,
      status: Status {
        code: "success".to_string(),
        message: "ok".to_string(),
      },
      continuation: Continuation::default(),
      actions: None,
    }
  }

  pub fn partial(data: Value, token: String) -> Self {
    Self {
      data,
      status: Status {
        code: "partial_success".to_string(),
        message: "more data available".to_string(),
      },
      continuation: Continuation {
        has_more: true,
        token: Some(token),
      },
      actions: None,
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self {
      data: Value::Null,
      status: Status {
        code: "error".to_string(),
        message: message.into(),
      },
      continuation: Continuation::default(),
      actions: None,
    }
  }

  pub fn is_error(&self) -> bool {
    self.status.code == "error"
  }
}

/// State behind an opaque continuation token.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ContinuationState {
  pub document_id: String,
  pub offset: usize,
}

pub fn encode_token(state: &ContinuationState) -> String {
  URL_SAFE_NO_PAD.encode(serde_json::to_vec(state).unwrap_or_default())
}

pub fn decode_token(token: &str) -> Option<ContinuationState> {
  let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
  serde_json::from_slice(&bytes).ok()
}

pub struct ToolHandler {
  config: Arc<Config>,
  registry: Arc<FolderRegistry>,
  scheduler: Arc<FolderScheduler>,
}

impl ToolHandler {
  pub fn new(config: Arc<Config>, registry: Arc<FolderRegistry>, scheduler: Arc<FolderScheduler>) -> Self {
    Self {
      config,
      registry,
      scheduler,
    }
  }

  /// Find a configured folder by name or path.
  fn find_folder(&self, key: &str) -> Option<FolderConfig> {
    self
      .config
      .folders
      .iter()
      .find(|f| f.display_name() == key || f.path == PathBuf::from(key))
      .cloned()
  }

  async fn open_folder(&self, key: &str) -> Result<(FolderConfig, Arc<FolderDb>), Envelope> {
    let Some(folder) = self.find_folder(key) else {
      return Err(Envelope::error(format!("unknown folder: {key}")));
    };
    match self.registry.get_or_open(&folder).await {
      Ok((db, _)) => Ok((folder, db)),
      Err(e) => Err(Envelope::error(e.to_string())),
    }
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  pub async fn search(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      query: String,
      #[serde(default)]
      folder: Option<String>,
      #[serde(default)]
      top_k: Option<usize>,
      #[serde(default)]
      threshold: Option<f32>,
      #[serde(default)]
      file_type: Option<String>,
      #[serde(default)]
      path_prefix: Option<String>,
      #[serde(default)]
      include_context: bool,
    }

    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let started = Instant::now();
    let top_k = args.top_k.unwrap_or(10).clamp(1, 100);
    let file_type = match args.file_type.as_deref().map(str::parse::<FileType>).transpose() {
      Ok(t) => t,
      Err(e) => return Envelope::error(e),
    };

    let folders: Vec<FolderConfig> = match &args.folder {
      Some(key) => match self.find_folder(key) {
        Some(f) => vec![f],
        None => return Envelope::error(format!("unknown folder: {key}")),
      },
      None => self.config.folders.clone(),
    };

    let mut options = SearchOptions::new(top_k);
    options.threshold = args.threshold.unwrap_or(0.0);
    options.file_type = file_type;
    options.path_prefix = args.path_prefix.clone();

    // Fan out across folder stores and merge by score
    let mut merged: Vec<Value> = Vec::new();
    for folder in &folders {
      let (db, backend) = match self.registry.get_or_open(folder).await {
        Ok(pair) => pair,
        Err(e) => {
          warn!(folder = %folder.path.display(), error = %e, "Skipping folder in search");
          continue;
        }
      };

      // The query is embedded with the model that indexed this folder
      let query_vector = match backend.embed_query(&args.query).await {
        Ok(v) => v.vector,
        Err(e) => {
          warn!(folder = %folder.path.display(), error = %e, "Query embedding failed");
          continue;
        }
      };

      let hits = match db.search_chunks(&query_vector, &options).await {
        Ok(hits) => hits,
        Err(e) => {
          warn!(folder = %folder.path.display(), error = %e, "Search failed");
          continue;
        }
      };

      for hit in hits {
        let context = if args.include_context {
          self.neighbor_context(&db, &hit.document_id, hit.chunk_index).await
        } else {
          None
        };

        merged.push(json!({
          "folder": folder.display_name(),
          "document_id": hit.document_id,
          "chunk_id": hit.chunk_id,
          "chunk_index": hit.chunk_index,
          "content": hit.content,
          "score": hit.score,
          "location": hit.location,
          "extraction_params": hit.extraction_params,
          "key_phrases": hit.key_phrases,
          "file_type": hit.file_type.as_str(),
          "title": hit.title,
          "context": context,
        }));
      }
    }

    merged.sort_by(|a, b| {
      let sa = a.get("score").and_then(Value::as_f64).unwrap_or(0.0);
      let sb = b.get("score").and_then(Value::as_f64).unwrap_or(0.0);
      sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(top_k);

    let total = merged.len();
    Envelope::success(json!({
      "results": merged,
      "total": total,
      "processing_time_ms": started.elapsed().as_millis() as u64,
      "pagination": { "count": total, "has_more": false },
    }))
  }

  async fn neighbor_context(&self, db: &FolderDb, document_id: &str, chunk_index: u32) -> Option<Value> {
    let from = chunk_index.saturating_sub(1);
    let to = chunk_index + 1;
    let neighbors = db.chunks_in_range(document_id, from, to).await.ok()?;
    let before = neighbors
      .iter()
      .find(|c| c.chunk_index + 1 == chunk_index)
      .map(|c| c.content.clone());
    let after = neighbors
      .iter()
      .find(|c| c.chunk_index == chunk_index + 1)
      .map(|c| c.content.clone());
    Some(json!({ "before": before, "after": after }))
  }

  // ==========================================================================
  // Folder and document listings
  // ==========================================================================

  pub async fn list_folders(&self) -> Envelope {
    let mut folders = Vec::new();
    for folder in &self.config.folders {
      let resolved = folder.resolved_path().ok();
      let document_count = match &resolved {
        Some(path) => match self.registry.get(path).await {
          Some(db) => db.count_documents().await.unwrap_or(0),
          None => 0,
        },
        None => 0,
      };

      folders.push(json!({
        "name": folder.display_name(),
        "path": folder.path,
        "resolved_path": resolved,
        "model": self.registry.model_for(folder),
        "document_count": document_count,
      }));
    }
    Envelope::success(json!({ "folders": folders }))
  }

  pub async fn list_documents(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      #[serde(default)]
      limit: Option<usize>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let (_, db) = match self.open_folder(&args.folder).await {
      Ok(pair) => pair,
      Err(e) => return e,
    };

    match db.list_documents(None, args.limit).await {
      Ok(documents) => {
        let rows: Vec<Value> = documents
          .iter()
          .map(|d| {
            json!({
              "document_id": d.document_id,
              "file_type": d.file_type.as_str(),
              "size_bytes": d.size_bytes,
              "modified": d.modified,
              "title": d.metadata.title,
              "keywords": d.document_keywords,
            })
          })
          .collect();
        Envelope::success(json!({ "documents": rows, "total": rows.len() }))
      }
      Err(e) => Envelope::error(e.to_string()),
    }
  }

  /// Structural outline of one document derived from its chunks'
  /// extraction params.
  pub async fn document_outline(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      document_id: String,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let (_, db) = match self.open_folder(&args.folder).await {
      Ok(pair) => pair,
      Err(e) => return e,
    };

    let record = match db.get_document(&args.document_id).await {
      Ok(Some(r)) => r,
      Ok(None) => return Envelope::error(format!("unknown document: {}", args.document_id)),
      Err(e) => return Envelope::error(e.to_string()),
    };
    let chunks = match db.chunks_for_document(&args.document_id).await {
      Ok(c) => c,
      Err(e) => return Envelope::error(e.to_string()),
    };

    let mut outline: Vec<Value> = Vec::new();
    let mut last_location = String::new();
    for chunk in &chunks {
      let location = chunk.extraction_params.location();
      if location != last_location {
        outline.push(json!({
          "location": location,
          "first_chunk_index": chunk.chunk_index,
        }));
        last_location = location;
      }
    }

    Envelope::success(json!({
      "document_id": record.document_id,
      "file_type": record.file_type.as_str(),
      "metadata": record.metadata,
      "chunk_count": chunks.len(),
      "outline": outline,
    }))
  }

  /// Document content in one of three formats, paginated by token
  /// budget with an opaque continuation token.
  pub async fn document_data(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      document_id: String,
      #[serde(default = "default_format")]
      format: String,
      #[serde(default)]
      max_tokens: Option<u32>,
      #[serde(default)]
      token: Option<String>,
    }
    fn default_format() -> String {
      "chunks".to_string()
    }

    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let (_, db) = match self.open_folder(&args.folder).await {
      Ok(pair) => pair,
      Err(e) => return e,
    };

    if args.format == "metadata" {
      return match db.get_document(&args.document_id).await {
        Ok(Some(record)) => Envelope::success(serde_json::to_value(&record).unwrap_or(Value::Null)),
        Ok(None) => Envelope::error(format!("unknown document: {}", args.document_id)),
        Err(e) => Envelope::error(e.to_string()),
      };
    }

    let chunks = match db.chunks_for_document(&args.document_id).await {
      Ok(c) if c.is_empty() => return Envelope::error(format!("unknown document: {}", args.document_id)),
      Ok(c) => c,
      Err(e) => return Envelope::error(e.to_string()),
    };

    let offset = match &args.token {
      Some(token) => match decode_token(token) {
        Some(state) if state.document_id == args.document_id => state.offset,
        Some(_) => return Envelope::error("continuation token is for a different document"),
        None => return Envelope::error("invalid continuation token"),
      },
      None => 0,
    };

    let max_tokens = args.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).max(1);
    let mut budget = 0u32;
    let mut page = Vec::new();
    let mut next_offset = None;

    for chunk in chunks.iter().skip_while(|c| (c.chunk_index as usize) < offset) {
      if budget + chunk.token_count > max_tokens && !page.is_empty() {
        next_offset = Some(chunk.chunk_index as usize);
        break;
      }
      budget += chunk.token_count;
      page.push(chunk);
    }

    let data = match args.format.as_str() {
      "raw" => {
        let text = page.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n");
        json!({ "document_id": args.document_id, "content": text })
      }
      "chunks" => {
        let rows: Vec<Value> = page
          .iter()
          .map(|c| {
            json!({
              "chunk_index": c.chunk_index,
              "content": c.content,
              "token_count": c.token_count,
              "extraction_params": c.extraction_params,
              "key_phrases": c.key_phrases,
              "readability_score": c.readability_score,
            })
          })
          .collect();
        json!({ "document_id": args.document_id, "chunks": rows })
      }
      other => return Envelope::error(format!("unknown format: {other}")),
    };

    match next_offset {
      Some(offset) => Envelope::partial(
        data,
        encode_token(&ContinuationState {
          document_id: args.document_id,
          offset,
        }),
      ),
      None => Envelope::success(data),
    }
  }

  // ==========================================================================
  // Format-specific views
  // ==========================================================================

  pub async fn sheet_data(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      document_id: String,
      #[serde(default)]
      sheet: Option<String>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let wanted_sheet = args.sheet;
    self
      .filtered_chunks(&args.folder, &args.document_id, move |params| match params {
        ExtractionParams::Sheet { sheet, start_row, end_row } => {
          if wanted_sheet.as_ref().is_none_or(|wanted| wanted == sheet) {
            Some(json!({ "sheet": sheet, "start_row": start_row, "end_row": end_row }))
          } else {
            None
          }
        }
        _ => None,
      })
      .await
  }

  pub async fn slides(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      document_id: String,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    self
      .filtered_chunks(&args.folder, &args.document_id, |params| match params {
        ExtractionParams::Slide { slide, .. } => Some(json!({ "slide": slide })),
        _ => None,
      })
      .await
  }

  pub async fn pages(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      folder: String,
      document_id: String,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    self
      .filtered_chunks(&args.folder, &args.document_id, |params| match params {
        ExtractionParams::Page { page, .. } => Some(json!({ "page": page })),
        _ => None,
      })
      .await
  }

  async fn filtered_chunks<F>(&self, folder: &str, document_id: &str, select: F) -> Envelope
  where
    F: Fn(&ExtractionParams) -> Option<Value>,
  {
    let (_, db) = match self.open_folder(folder).await {
      Ok(pair) => pair,
      Err(e) => return e,
    };

    let chunks = match db.chunks_for_document(document_id).await {
      Ok(c) => c,
      Err(e) => return Envelope::error(e.to_string()),
    };

    let rows: Vec<Value> = chunks
      .iter()
      .filter_map(|c| {
        select(&c.extraction_params).map(|location| {
          json!({
            "chunk_index": c.chunk_index,
            "content": c.content,
            "location": location,
          })
        })
      })
      .collect();

    if rows.is_empty() {
      return Envelope::error(format!("no matching regions in {document_id}"));
    }
    Envelope::success(json!({ "document_id": document_id, "regions": rows, "total": rows.len() }))
  }

  // ==========================================================================
  // Embedding, status, indexing controls
  // ==========================================================================

  pub async fn embedding(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      text: String,
      #[serde(default)]
      model: Option<String>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let model_id = args.model.unwrap_or_else(|| self.config.embedding.model.clone());
    let backend = match self.registry.backends().get_or_create(&model_id).await {
      Ok(b) => b,
      Err(e) => return Envelope::error(e.to_string()),
    };

    match backend.embed_query(&args.text).await {
      Ok(embedded) => Envelope::success(json!({
        "model": embedded.model,
        "dimensions": embedded.dim,
        "vector": embedded.vector,
      })),
      Err(e) => Envelope::error(e.to_string()),
    }
  }

  pub async fn status(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      #[serde(default)]
      folder: Option<String>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    if let Some(key) = &args.folder {
      let Some(folder) = self.find_folder(key) else {
        return Envelope::error(format!("unknown folder: {key}"));
      };
      let Ok(resolved) = folder.resolved_path() else {
        return Envelope::error(format!("cannot resolve folder: {key}"));
      };
      let status = self.scheduler.status(&resolved).await;
      return Envelope::success(serde_json::to_value(&status).unwrap_or(Value::Null));
    }

    let statuses: Vec<Value> = self
      .scheduler
      .status_all()
      .await
      .into_iter()
      .map(|(path, status)| json!({ "folder": path, "status": status }))
      .collect();

    Envelope::success(json!({
      "indexing": statuses,
      "active_jobs": self.scheduler.resources().active_jobs().await,
      "queued_jobs": self.scheduler.resources().queued_jobs().await,
      "throttled": self.scheduler.resources().is_throttled(),
      "loaded_models": self.registry.backends().loaded_models().await,
    }))
  }

  pub async fn index_folders(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      #[serde(default)]
      folder: Option<String>,
      #[serde(default)]
      force: bool,
      #[serde(default)]
      continue_on_error: Option<bool>,
      #[serde(default)]
      max_concurrent_folders: Option<usize>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    let options = IndexOptions {
      force_reindex: args.force,
      continue_on_error: args.continue_on_error.unwrap_or(true),
      max_concurrent_folders: args.max_concurrent_folders,
      ..Default::default()
    };

    if let Some(key) = &args.folder {
      let Some(folder) = self.find_folder(key) else {
        return Envelope::error(format!("unknown folder: {key}"));
      };
      let result = self.scheduler.index_folder(&folder, &options).await;
      let envelope = serde_json::to_value(&result).unwrap_or(Value::Null);
      return if result.success {
        Envelope::success(envelope)
      } else {
        Envelope::error(result.error.unwrap_or_else(|| "indexing failed".to_string()))
      };
    }

    let result = self.scheduler.clone().index_all(&self.config.folders, &options).await;
    let value = serde_json::to_value(&result).unwrap_or(Value::Null);
    if result.success {
      Envelope::success(value)
    } else {
      let mut envelope = Envelope::error("one or more folders failed");
      envelope.data = value;
      envelope
    }
  }

  pub async fn cancel(&self, params: Value) -> Envelope {
    #[derive(Deserialize)]
    struct Args {
      #[serde(default)]
      folder: Option<String>,
    }
    let args: Args = match serde_json::from_value(params) {
      Ok(a) => a,
      Err(e) => return Envelope::error(format!("invalid params: {e}")),
    };

    match &args.folder {
      Some(key) => {
        let Some(folder) = self.find_folder(key) else {
          return Envelope::error(format!("unknown folder: {key}"));
        };
        let Ok(resolved) = folder.resolved_path() else {
          return Envelope::error(format!("cannot resolve folder: {key}"));
        };
        let cancelled = self.scheduler.cancel(&resolved).await;
        Envelope::success(json!({ "cancelled": cancelled }))
      }
      None => {
        let count = self.scheduler.cancel_all().await;
        Envelope::success(json!({ "cancelled_jobs": count }))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_envelope_shapes() {
    let ok = Envelope::success(json!({"x": 1}));
    assert_eq!(ok.status.code, "success");
    assert!(!ok.continuation.has_more);

    let partial = Envelope::partial(json!([]), "tok".to_string());
    assert_eq!(partial.status.code, "partial_success");
    assert!(partial.continuation.has_more);
    assert_eq!(partial.continuation.token.as_deref(), Some("tok"));

    let err = Envelope::error("boom");
    assert!(err.is_error());
    assert_eq!(err.data, Value::Null);
  }

  #[test]
  fn test_continuation_token_roundtrip() {
    let state = ContinuationState {
      document_id: "reports/q1.md".to_string(),
      offset: 17,
    };
    let token = encode_token(&state);
    let decoded = decode_token(&token).unwrap();
    assert_eq!(decoded, state);
  }

  #[test]
  fn test_decode_garbage_token() {
    assert!(decode_token("not base64 at all!!!").is_none());
    assert!(decode_token(&URL_SAFE_NO_PAD.encode(b"not json")).is_none());
  }
}
