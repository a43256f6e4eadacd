//! Format parsers.
//!
//! Every parser produces the same output contract: normalized text
//! content plus a format-aware region map. Regions are contiguous,
//! ordered spans of the content (section, page, slide, or sheet row
//! group); the chunker cuts within them so every chunk can name the
//! exact source region it came from.

mod office;
mod pdf;
pub(crate) mod text;

use foldex_core::{DocumentMetadata, FileType};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
  #[error("Unsupported file type: {0}")]
  UnsupportedFileType(PathBuf),
  #[error("Corrupt document: {0}")]
  Corrupted(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

impl ParseError {
  /// Corrupt or unsupported content is not retried.
  pub fn is_corrupted(&self) -> bool {
    matches!(self, ParseError::Corrupted(_) | ParseError::UnsupportedFileType(_))
  }
}

/// The natural unit a region maps back to in the source document.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionKind {
  Section { name: String },
  Page { number: u32 },
  Slide { number: u32 },
  Sheet { name: String, start_row: u32, end_row: u32 },
}

/// A contiguous span of the parsed content.
#[derive(Debug, Clone)]
pub struct Region {
  pub kind: RegionKind,
  pub start: usize,
  pub end: usize,
}

/// Parser output contract.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
  pub content: String,
  pub file_type: FileType,
  pub metadata: DocumentMetadata,
  pub regions: Vec<Region>,
}

impl ParsedDocument {
  pub fn region_text<'a>(&'a self, region: &Region) -> &'a str {
    &self.content[region.start..region.end]
  }

  /// Structural hints (section names, title) that bias keyphrase zones.
  pub fn structural_hints(&self) -> Vec<String> {
    let mut hints = Vec::new();
    if let Some(title) = &self.metadata.title {
      hints.push(title.clone());
    }
    for region in &self.regions {
      if let RegionKind::Section { name } = &region.kind
        && name != "body"
      {
        hints.push(name.clone());
      }
    }
    hints
  }
}

/// Helper shared by the per-format parsers: append region texts with a
/// blank-line separator that belongs to no region, tracking offsets.
pub(crate) struct ContentBuilder {
  content: String,
  regions: Vec<Region>,
}

impl ContentBuilder {
  pub fn new() -> Self {
    Self {
      content: String::new(),
      regions: Vec::new(),
    }
  }

  pub fn push_region(&mut self, kind: RegionKind, text: &str) {
    let text = text.trim();
    if text.is_empty() {
      return;
    }
    if !self.content.is_empty() {
      self.content.push_str("\n\n");
    }
    let start = self.content.len();
    self.content.push_str(text);
    self.regions.push(Region {
      kind,
      start,
      end: self.content.len(),
    });
  }

  pub fn finish(self, file_type: FileType, metadata: DocumentMetadata) -> ParsedDocument {
    ParsedDocument {
      content: self.content,
      file_type,
      metadata,
      regions: self.regions,
    }
  }
}

/// Parse a file by type. Heavy formats run on the blocking pool.
pub async fn parse_file(path: &Path, file_type: FileType) -> Result<ParsedDocument, ParseError> {
  match file_type {
    FileType::Text => {
      let raw = tokio::fs::read_to_string(path).await?;
      Ok(text::parse_text(&raw))
    }
    FileType::Markdown => {
      let raw = tokio::fs::read_to_string(path).await?;
      Ok(text::parse_markdown(&raw))
    }
    FileType::Pdf => {
      let bytes = tokio::fs::read(path).await?;
      tokio::task::spawn_blocking(move || pdf::parse_pdf(&bytes))
        .await
        .map_err(|e| ParseError::Corrupted(format!("parser task failed: {e}")))?
    }
    FileType::Word | FileType::Spreadsheet | FileType::Presentation => {
      let bytes = tokio::fs::read(path).await?;
      tokio::task::spawn_blocking(move || match file_type {
        FileType::Word => office::parse_docx(&bytes),
        FileType::Spreadsheet => office::parse_xlsx(&bytes),
        FileType::Presentation => office::parse_pptx(&bytes),
        _ => unreachable!(),
      })
      .await
      .map_err(|e| ParseError::Corrupted(format!("parser task failed: {e}")))?
    }
  }
}

/// Classify a path or fail with the non-recoverable unsupported error.
pub fn file_type_for(path: &Path) -> Result<FileType, ParseError> {
  FileType::from_path(path).ok_or_else(|| ParseError::UnsupportedFileType(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_content_builder_offsets() {
    let mut builder = ContentBuilder::new();
    builder.push_region(RegionKind::Page { number: 1 }, "first page");
    builder.push_region(RegionKind::Page { number: 2 }, "  second page  ");
    builder.push_region(RegionKind::Page { number: 3 }, "   "); // dropped

    let doc = builder.finish(FileType::Pdf, DocumentMetadata::default());
    assert_eq!(doc.regions.len(), 2);
    assert_eq!(doc.region_text(&doc.regions[0]), "first page");
    assert_eq!(doc.region_text(&doc.regions[1]), "second page");
    assert_eq!(doc.content, "first page\n\nsecond page");
  }

  #[test]
  fn test_file_type_for_unsupported() {
    let err = file_type_for(Path::new("binary.exe")).unwrap_err();
    assert!(err.is_corrupted());
    assert!(matches!(err, ParseError::UnsupportedFileType(_)));
  }

  #[tokio::test]
  async fn test_parse_file_text() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "hello\n\nworld").unwrap();

    let doc = parse_file(&path, FileType::Text).await.unwrap();
    assert_eq!(doc.content, "hello\n\nworld");
    assert_eq!(doc.metadata.paragraph_count, Some(2));
  }
}
