//! PDF parser over pdf-extract's plain-text output.

use foldex_core::{DocumentMetadata, FileType};

use super::{ContentBuilder, ParseError, ParsedDocument, RegionKind};

/// Extract text and split into page regions on form feeds. Extractors
/// that do not emit page breaks yield a single-page document.
pub fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let raw = pdf_extract::extract_text_from_mem(bytes)
    .map_err(|e| ParseError::Corrupted(format!("pdf extraction failed: {e}")))?;

  let pages: Vec<&str> = if raw.contains('\u{c}') {
    raw.split('\u{c}').collect()
  } else {
    vec![raw.as_str()]
  };

  let mut builder = ContentBuilder::new();
  let mut page_number = 0u32;
  for page in pages {
    if page.trim().is_empty() {
      continue;
    }
    page_number += 1;
    builder.push_region(RegionKind::Page { number: page_number }, page);
  }

  if page_number == 0 {
    return Err(ParseError::Corrupted("pdf contains no extractable text".to_string()));
  }

  Ok(builder.finish(
    FileType::Pdf,
    DocumentMetadata {
      page_count: Some(page_number),
      ..Default::default()
    },
  ))
}
