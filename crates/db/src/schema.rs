use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Schema for the documents table. One row per indexed file; the
/// document embedding is stored serialized since it is never
/// vector-searched directly.
pub fn documents_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("document_id", DataType::Utf8, false),
    Field::new("file_type", DataType::Utf8, false),
    Field::new("size_bytes", DataType::UInt64, false),
    Field::new("created_at", DataType::Int64, false), // Unix timestamp ms
    Field::new("modified_at", DataType::Int64, false),
    Field::new("title", DataType::Utf8, true),
    Field::new("author", DataType::Utf8, true),
    Field::new("page_count", DataType::UInt32, true),
    Field::new("slide_count", DataType::UInt32, true),
    Field::new("sheet_count", DataType::UInt32, true),
    Field::new("paragraph_count", DataType::UInt32, true),
    Field::new("document_embedding", DataType::Utf8, true), // JSON array
    Field::new("document_keywords", DataType::Utf8, true),  // JSON array
    Field::new("processing_time_ms", DataType::UInt64, false),
  ]))
}

/// Schema for the chunks table. Unique on (document_id, chunk_index).
pub fn chunks_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("chunk_id", DataType::Utf8, false),
    Field::new("document_id", DataType::Utf8, false),
    Field::new("chunk_index", DataType::UInt32, false),
    Field::new("content", DataType::Utf8, false),
    Field::new("start_offset", DataType::UInt64, false),
    Field::new("end_offset", DataType::UInt64, false),
    Field::new("token_count", DataType::UInt32, false),
    Field::new("extraction_params", DataType::Utf8, false), // JSON object
    Field::new("key_phrases", DataType::Utf8, false),       // JSON array
    Field::new("readability", DataType::Float32, false),
  ]))
}

/// Schema for the embeddings table. One row per chunk (1:1); carries
/// document_id so document cascades are single predicates.
pub fn embeddings_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("chunk_id", DataType::Utf8, false),
    Field::new("document_id", DataType::Utf8, false),
    Field::new("model", DataType::Utf8, false),
    Field::new("created_at", DataType::Int64, false),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
  ]))
}

/// Schema for the file_states table. At most one row per file path.
pub fn file_states_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("file_path", DataType::Utf8, false),
    Field::new("content_hash", DataType::Utf8, false),
    Field::new("state", DataType::Utf8, false),
    Field::new("attempt_count", DataType::UInt32, false),
    Field::new("last_attempt", DataType::Int64, false),
    Field::new("last_error", DataType::Utf8, true),
    Field::new("corrupted", DataType::Boolean, false),
    Field::new("chunk_count", DataType::UInt32, true),
  ]))
}
