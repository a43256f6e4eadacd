use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rough character-per-token estimate used only for chunk sizing, never
/// for model input.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunks never shrink below this many characters.
pub const MIN_CHUNK_CHARS: usize = 500;

/// Supported document types (extension allow-list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
  Text,
  Markdown,
  Pdf,
  Word,
  Spreadsheet,
  Presentation,
}

impl FileType {
  /// Classify a path by extension; `None` means unsupported.
  pub fn from_path(path: &std::path::Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "txt" => Some(FileType::Text),
      "md" | "markdown" => Some(FileType::Markdown),
      "pdf" => Some(FileType::Pdf),
      "docx" => Some(FileType::Word),
      "xlsx" => Some(FileType::Spreadsheet),
      "pptx" => Some(FileType::Presentation),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      FileType::Text => "text",
      FileType::Markdown => "markdown",
      FileType::Pdf => "pdf",
      FileType::Word => "word",
      FileType::Spreadsheet => "spreadsheet",
      FileType::Presentation => "presentation",
    }
  }
}

impl std::str::FromStr for FileType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "text" => Ok(FileType::Text),
      "markdown" => Ok(FileType::Markdown),
      "pdf" => Ok(FileType::Pdf),
      "word" => Ok(FileType::Word),
      "spreadsheet" => Ok(FileType::Spreadsheet),
      "presentation" => Ok(FileType::Presentation),
      _ => Err(format!("unknown file type: {s}")),
    }
  }
}

/// Parsed document metadata, format-aware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub slide_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sheet_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub paragraph_count: Option<u32>,
}

/// One indexed document. `document_id` is the folder-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
  pub document_id: String,
  pub file_type: FileType,
  pub size_bytes: u64,
  pub created: DateTime<Utc>,
  pub modified: DateTime<Utc>,
  pub metadata: DocumentMetadata,

  /// Mean of the chunk embeddings; enhancement, may be absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_embedding: Option<Vec<f32>>,

  /// Document-level keywords; enhancement, may be absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_keywords: Option<Vec<KeyPhrase>>,

  pub processing_time_ms: u64,
}

/// Region of the source document a chunk was cut from.
///
/// `(document_id, chunk_index) → extraction params → source region` is
/// deterministic, so the original region can always be reconstructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionParams {
  /// Character span within a text/markdown section.
  Section { section: String, start: usize, end: usize },
  /// PDF page (1-based) and character span within it.
  Page { page: u32, start: usize, end: usize },
  /// Presentation slide (1-based).
  Slide { slide: u32, start: usize, end: usize },
  /// Spreadsheet sheet with a contiguous row group.
  Sheet {
    sheet: String,
    start_row: u32,
    end_row: u32,
  },
}

impl ExtractionParams {
  /// Short human-readable location hint for search results.
  pub fn location(&self) -> String {
    match self {
      ExtractionParams::Section { section, .. } => format!("section {section}"),
      ExtractionParams::Page { page, .. } => format!("page {page}"),
      ExtractionParams::Slide { slide, .. } => format!("slide {slide}"),
      ExtractionParams::Sheet { sheet, start_row, end_row } => {
        format!("sheet {sheet} rows {start_row}-{end_row}")
      }
    }
  }
}

/// Scored keyphrase attached to a chunk or document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPhrase {
  pub text: String,
  pub score: f32,
}

/// One chunk of a document, ready for embedding and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
  pub document_id: String,
  pub chunk_index: u32,
  pub content: String,
  pub start_offset: usize,
  pub end_offset: usize,
  pub token_count: u32,
  pub extraction_params: ExtractionParams,
  #[serde(default)]
  pub key_phrases: Vec<KeyPhrase>,
  #[serde(default)]
  pub readability_score: f32,
}

impl DocumentChunk {
  pub fn id(&self) -> String {
    chunk_id(&self.document_id, self.chunk_index)
  }
}

/// Deterministic chunk id: replacement writes delete by document, so no
/// separate id bookkeeping is needed.
pub fn chunk_id(document_id: &str, chunk_index: u32) -> String {
  format!("{document_id}#{chunk_index:05}")
}

/// Token estimate for sizing decisions: word count × 1.3, or chars / 4
/// when the text has no word boundaries.
pub fn estimate_tokens(text: &str) -> u32 {
  let words = text.split_whitespace().count();
  if words > 0 {
    (words as f64 * 1.3).ceil() as u32
  } else {
    text.len().div_ceil(CHARS_PER_TOKEN) as u32
  }
}

/// Effective chunk size in characters for a model context window.
///
/// `⌊ctx/4⌋ × 4 × multiplier`, where larger windows use a smaller share
/// so several chunks fit a single request. Floors at [`MIN_CHUNK_CHARS`].
pub fn effective_chunk_chars(context_window: usize) -> usize {
  let base = (context_window / CHARS_PER_TOKEN) * CHARS_PER_TOKEN;
  let multiplier = if context_window >= 8192 {
    0.5
  } else if context_window >= 2048 {
    0.75
  } else {
    1.0
  };
  ((base as f64 * multiplier) as usize).max(MIN_CHUNK_CHARS)
}
