//! Model-aware document chunker.
//!
//! Chunks are cut region by region so natural boundaries (page, slide,
//! sheet row group, section) are never crossed. Within a region, splits
//! prefer paragraph breaks, then sentence ends, then whitespace, and
//! never land inside a word. Chunk content is always an exact slice of
//! the parsed content, so `(document_id, chunk_index)` plus the recorded
//! extraction params reproduce the source region byte for byte.

use foldex_core::{DocumentChunk, ExtractionParams, effective_chunk_chars, estimate_tokens};

use crate::parser::{ParsedDocument, RegionKind};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
  /// Embedding model context window in tokens.
  pub context_window: usize,
  /// Overlap between adjacent chunks as a fraction of chunk size.
  pub overlap_fraction: f32,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      context_window: 2048,
      overlap_fraction: 0.10,
    }
  }
}

/// Cut a parsed document into ordered chunks with dense indices.
pub fn chunk_document(doc: &ParsedDocument, document_id: &str, config: &ChunkerConfig) -> Vec<DocumentChunk> {
  let budget = effective_chunk_chars(config.context_window);
  let overlap = (budget as f32 * config.overlap_fraction.clamp(0.0, 0.5)) as usize;

  let mut chunks = Vec::new();
  let mut chunk_index = 0u32;

  for region in &doc.regions {
    let region_text = doc.region_text(region);

    match &region.kind {
      RegionKind::Sheet { name, start_row, .. } => {
        for (rel_start, rel_end, first_line, last_line) in sheet_spans(region_text, budget) {
          let content = &region_text[rel_start..rel_end];
          chunks.push(make_chunk(
            document_id,
            chunk_index,
            content,
            region.start + rel_start,
            region.start + rel_end,
            ExtractionParams::Sheet {
              sheet: name.clone(),
              start_row: start_row + first_line,
              end_row: start_row + last_line,
            },
          ));
          chunk_index += 1;
        }
      }
      kind => {
        for (rel_start, rel_end) in text_spans(region_text, budget, overlap) {
          let content = &region_text[rel_start..rel_end];
          let params = match kind {
            RegionKind::Section { name } => ExtractionParams::Section {
              section: name.clone(),
              start: rel_start,
              end: rel_end,
            },
            RegionKind::Page { number } => ExtractionParams::Page {
              page: *number,
              start: rel_start,
              end: rel_end,
            },
            RegionKind::Slide { number } => ExtractionParams::Slide {
              slide: *number,
              start: rel_start,
              end: rel_end,
            },
            RegionKind::Sheet { .. } => unreachable!(),
          };
          chunks.push(make_chunk(
            document_id,
            chunk_index,
            content,
            region.start + rel_start,
            region.start + rel_end,
            params,
          ));
          chunk_index += 1;
        }
      }
    }
  }

  chunks
}

fn make_chunk(
  document_id: &str,
  chunk_index: u32,
  content: &str,
  start_offset: usize,
  end_offset: usize,
  extraction_params: ExtractionParams,
) -> DocumentChunk {
  DocumentChunk {
    document_id: document_id.to_string(),
    chunk_index,
    content: content.to_string(),
    start_offset,
    end_offset,
    token_count: estimate_tokens(content),
    extraction_params,
    key_phrases: Vec::new(),
    readability_score: 0.0,
  }
}

/// Spans over free text: paragraph > sentence > whitespace splits with
/// overlap, trimmed to non-whitespace edges.
fn text_spans(text: &str, budget: usize, overlap: usize) -> Vec<(usize, usize)> {
  let mut spans = Vec::new();
  if text.trim().is_empty() {
    return spans;
  }

  if text.len() <= budget {
    if let Some(span) = trim_span(text, 0, text.len()) {
      spans.push(span);
    }
    return spans;
  }

  let paragraph_breaks = paragraph_break_positions(text);
  let sentence_breaks = sentence_break_positions(text);

  let mut start = skip_whitespace(text, 0);
  while start < text.len() {
    let mut hard_end = (start + budget).min(text.len());
    while !text.is_char_boundary(hard_end) {
      hard_end -= 1;
    }

    if hard_end >= text.len() {
      if let Some(span) = trim_span(text, start, text.len()) {
        spans.push(span);
      }
      break;
    }

    let end = pick_break(&paragraph_breaks, start, hard_end)
      .or_else(|| pick_break(&sentence_breaks, start, hard_end))
      .or_else(|| whitespace_break(text, start, hard_end))
      .unwrap_or_else(|| word_end_after(text, hard_end));

    if let Some(span) = trim_span(text, start, end) {
      spans.push(span);
    }

    if end >= text.len() {
      break;
    }

    let mut next = end.saturating_sub(overlap).max(start + 1);
    next = snap_to_word_start(text, next, end);
    let next = skip_whitespace(text, next);
    if next <= start {
      break;
    }
    start = next;
  }

  spans
}

/// Spans over sheet text: whole lines (rows) grouped up to the budget.
/// Returns (start, end, first_line_index, last_line_index).
fn sheet_spans(text: &str, budget: usize) -> Vec<(usize, usize, u32, u32)> {
  let mut spans = Vec::new();

  let mut line_start = 0usize;
  let mut group_start: Option<(usize, u32)> = None;
  let mut line_index = 0u32;
  let mut last_end = 0usize;
  let mut last_line = 0u32;

  let mut lines: Vec<(usize, usize, u32)> = Vec::new();
  for line in text.split('\n') {
    let end = line_start + line.len();
    lines.push((line_start, end, line_index));
    line_start = end + 1;
    line_index += 1;
  }

  for (start, end, index) in lines {
    match group_start {
      None => {
        group_start = Some((start, index));
        last_end = end;
        last_line = index;
      }
      Some((g_start, g_line)) => {
        if end - g_start > budget {
          spans.push((g_start, last_end, g_line, last_line));
          group_start = Some((start, index));
        }
        last_end = end;
        last_line = index;
      }
    }
  }

  if let Some((g_start, g_line)) = group_start
    && last_end > g_start
  {
    spans.push((g_start, last_end, g_line, last_line));
  }

  spans
}

/// Positions right before a blank-line separator.
fn paragraph_break_positions(text: &str) -> Vec<usize> {
  let bytes = text.as_bytes();
  let mut positions = Vec::new();
  let mut i = 0;
  while i + 1 < bytes.len() {
    if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
      positions.push(i);
      while i < bytes.len() && bytes[i] == b'\n' {
        i += 1;
      }
    } else {
      i += 1;
    }
  }
  positions
}

/// Positions just after sentence-ending punctuation followed by space.
fn sentence_break_positions(text: &str) -> Vec<usize> {
  let mut positions = Vec::new();
  for (i, c) in text.char_indices() {
    if matches!(c, '.' | '!' | '?') {
      let after = i + c.len_utf8();
      if text[after..].chars().next().is_none_or(|n| n.is_whitespace()) {
        positions.push(after);
      }
    }
  }
  positions
}

/// Largest break in (start, limit], if any.
fn pick_break(breaks: &[usize], start: usize, limit: usize) -> Option<usize> {
  let idx = breaks.partition_point(|&b| b <= limit);
  if idx == 0 {
    return None;
  }
  let candidate = breaks[idx - 1];
  (candidate > start).then_some(candidate)
}

/// Last whitespace position in (start, limit], as a cut point.
fn whitespace_break(text: &str, start: usize, limit: usize) -> Option<usize> {
  text[start..limit]
    .char_indices()
    .rev()
    .find(|(_, c)| c.is_whitespace())
    .map(|(i, _)| start + i)
    .filter(|&p| p > start)
}

/// No usable break at all: extend forward to the end of the word so we
/// never cut inside it.
fn word_end_after(text: &str, pos: usize) -> usize {
  text[pos..]
    .find(|c: char| c.is_whitespace())
    .map(|i| pos + i)
    .unwrap_or(text.len())
}

fn skip_whitespace(text: &str, mut pos: usize) -> usize {
  while pos < text.len() {
    let Some(c) = text[pos..].chars().next() else { break };
    if !c.is_whitespace() {
      break;
    }
    pos += c.len_utf8();
  }
  pos
}

/// Move a tentative overlap start forward so it begins at a word start.
fn snap_to_word_start(text: &str, mut pos: usize, fallback: usize) -> usize {
  while pos < text.len() && !text.is_char_boundary(pos) {
    pos += 1;
  }
  if pos == 0 {
    return 0;
  }
  let before = text[..pos].chars().next_back();
  if before.is_none_or(|c| c.is_whitespace()) {
    return pos;
  }
  match text[pos..].find(|c: char| c.is_whitespace()) {
    Some(i) => pos + i,
    None => fallback,
  }
}

fn trim_span(text: &str, mut start: usize, mut end: usize) -> Option<(usize, usize)> {
  while start < end {
    let Some(c) = text[start..].chars().next() else { break };
    if !c.is_whitespace() {
      break;
    }
    start += c.len_utf8();
  }
  while end > start {
    let Some(c) = text[..end].chars().next_back() else { break };
    if !c.is_whitespace() {
      break;
    }
    end -= c.len_utf8();
  }
  (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::text::{parse_markdown, parse_text};
  use foldex_core::MIN_CHUNK_CHARS;

  fn small_config() -> ChunkerConfig {
    ChunkerConfig {
      context_window: 100, // floors at MIN_CHUNK_CHARS
      overlap_fraction: 0.10,
    }
  }

  fn sentences(n: usize) -> String {
    (0..n)
      .map(|i| format!("This is sentence number {i} with a bit of padding text."))
      .collect::<Vec<_>>()
      .join(" ")
  }

  #[test]
  fn test_small_doc_single_chunk() {
    let doc = parse_text("just a short note");
    let chunks = chunk_document(&doc, "a.txt", &ChunkerConfig::default());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[0].content, "just a short note");
  }

  #[test]
  fn test_dense_indices_and_exact_slices() {
    let doc = parse_text(&sentences(60));
    let chunks = chunk_document(&doc, "a.txt", &small_config());
    assert!(chunks.len() > 1);

    for (i, chunk) in chunks.iter().enumerate() {
      assert_eq!(chunk.chunk_index, i as u32);
      // Round-trip: offsets reproduce content byte-for-byte
      assert_eq!(&doc.content[chunk.start_offset..chunk.end_offset], chunk.content);
      assert!(chunk.content.len() <= MIN_CHUNK_CHARS + 60);
      assert!(chunk.token_count > 0);
    }
  }

  #[test]
  fn test_never_splits_inside_word() {
    let doc = parse_text(&sentences(60));
    let chunks = chunk_document(&doc, "a.txt", &small_config());

    for chunk in &chunks {
      let first = chunk.content.chars().next().unwrap();
      let last = chunk.content.chars().next_back().unwrap();
      assert!(!first.is_whitespace());
      assert!(!last.is_whitespace());

      // Char before the chunk (if any) must not be alphanumeric
      if chunk.start_offset > 0 {
        let before = doc.content[..chunk.start_offset].chars().next_back().unwrap();
        assert!(!before.is_alphanumeric(), "chunk starts mid-word after {before:?}");
      }
      // Char after the chunk (if any) must not be alphanumeric
      if chunk.end_offset < doc.content.len() {
        let after = doc.content[chunk.end_offset..].chars().next().unwrap();
        assert!(!after.is_alphanumeric(), "chunk ends mid-word before {after:?}");
      }
    }
  }

  #[test]
  fn test_overlap_between_chunks() {
    let doc = parse_text(&sentences(60));
    let chunks = chunk_document(&doc, "a.txt", &small_config());
    assert!(chunks.len() > 1);

    for pair in chunks.windows(2) {
      // Overlapping or adjacent, never a gap that loses text words
      assert!(pair[1].start_offset <= pair[0].end_offset + 2);
    }
  }

  #[test]
  fn test_markdown_sections_not_crossed() {
    let md = format!("# One\n\n{}\n\n# Two\n\n{}", sentences(3), sentences(3));
    let doc = parse_markdown(&md);
    let chunks = chunk_document(&doc, "a.md", &ChunkerConfig::default());

    for chunk in &chunks {
      match &chunk.extraction_params {
        ExtractionParams::Section { section, start, end } => {
          // Region-relative offsets reconstruct the same bytes
          let region = doc
            .regions
            .iter()
            .find(|r| matches!(&r.kind, RegionKind::Section { name } if name == section))
            .unwrap();
          assert_eq!(&doc.content[region.start + start..region.start + end], chunk.content);
        }
        other => panic!("expected section params, got {other:?}"),
      }
    }
  }

  #[test]
  fn test_sheet_chunks_group_rows() {
    use crate::parser::{ContentBuilder, RegionKind};
    use foldex_core::{DocumentMetadata, FileType};

    let rows: Vec<String> = (1..=40).map(|i| format!("item {i} | {} | widgets", i * 10)).collect();
    let mut builder = ContentBuilder::new();
    builder.push_region(
      RegionKind::Sheet {
        name: "Q1".to_string(),
        start_row: 1,
        end_row: 40,
      },
      &rows.join("\n"),
    );
    let doc = builder.finish(FileType::Spreadsheet, DocumentMetadata::default());

    let chunks = chunk_document(&doc, "b.xlsx", &small_config());
    assert!(chunks.len() > 1);

    let mut expected_next_row = 1;
    for chunk in &chunks {
      match &chunk.extraction_params {
        ExtractionParams::Sheet { sheet, start_row, end_row } => {
          assert_eq!(sheet, "Q1");
          assert_eq!(*start_row, expected_next_row);
          assert!(end_row >= start_row);
          expected_next_row = end_row + 1;
          // Whole rows only: content never starts or ends mid-line
          assert!(!chunk.content.starts_with(' '));
          assert!(!chunk.content.ends_with('\n'));
          assert_eq!(&doc.content[chunk.start_offset..chunk.end_offset], chunk.content);
        }
        other => panic!("expected sheet params, got {other:?}"),
      }
    }
    assert_eq!(expected_next_row, 41);
  }

  #[test]
  fn test_empty_document() {
    let doc = parse_text("");
    assert!(chunk_document(&doc, "a.txt", &ChunkerConfig::default()).is_empty());
  }
}
