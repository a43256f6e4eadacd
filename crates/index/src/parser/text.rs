//! Plain-text and Markdown parsers.

use foldex_core::{DocumentMetadata, FileType};
use pulldown_cmark::{Event, Parser, Tag, TagEnd};

use super::{ContentBuilder, ParsedDocument, RegionKind};

/// Plain text: one body section, paragraphs split on blank lines.
pub fn parse_text(raw: &str) -> ParsedDocument {
  let normalized = raw.replace("\r\n", "\n");
  let paragraph_count = normalized.split("\n\n").filter(|p| !p.trim().is_empty()).count() as u32;

  let mut builder = ContentBuilder::new();
  builder.push_region(
    RegionKind::Section {
      name: "body".to_string(),
    },
    &normalized,
  );

  builder.finish(
    FileType::Text,
    DocumentMetadata {
      paragraph_count: Some(paragraph_count),
      ..Default::default()
    },
  )
}

/// Markdown: sections cut at headings, title from the first heading.
pub fn parse_markdown(raw: &str) -> ParsedDocument {
  let parser = Parser::new(raw);

  let mut sections: Vec<(String, String)> = Vec::new();
  let mut current_name = "body".to_string();
  let mut current_text = String::new();
  let mut heading_text: Option<String> = None;
  let mut title: Option<String> = None;
  let mut paragraph_count = 0u32;

  let mut flush = |name: &str, text: &mut String, sections: &mut Vec<(String, String)>| {
    if !text.trim().is_empty() {
      sections.push((name.to_string(), std::mem::take(text)));
    } else {
      text.clear();
    }
  };

  for event in parser {
    match event {
      Event::Start(Tag::Heading { .. }) => {
        flush(&current_name, &mut current_text, &mut sections);
        heading_text = Some(String::new());
      }
      Event::End(TagEnd::Heading(_)) => {
        let name = heading_text.take().unwrap_or_default();
        let name = name.trim().to_string();
        if title.is_none() && !name.is_empty() {
          title = Some(name.clone());
        }
        current_name = if name.is_empty() { "body".to_string() } else { name };
      }
      Event::Text(t) | Event::Code(t) => {
        if let Some(h) = heading_text.as_mut() {
          h.push_str(&t);
        } else {
          current_text.push_str(&t);
        }
      }
      Event::SoftBreak => {
        if heading_text.is_none() {
          current_text.push('\n');
        }
      }
      Event::HardBreak => {
        if heading_text.is_none() {
          current_text.push('\n');
        }
      }
      Event::End(TagEnd::Paragraph) | Event::End(TagEnd::Item) => {
        paragraph_count += 1;
        current_text.push_str("\n\n");
      }
      Event::End(TagEnd::CodeBlock) => {
        current_text.push_str("\n\n");
      }
      _ => {}
    }
  }
  flush(&current_name, &mut current_text, &mut sections);

  let mut builder = ContentBuilder::new();
  for (name, text) in &sections {
    builder.push_region(RegionKind::Section { name: name.clone() }, text);
  }

  builder.finish(
    FileType::Markdown,
    DocumentMetadata {
      title,
      paragraph_count: Some(paragraph_count),
      ..Default::default()
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_text_paragraphs() {
    let doc = parse_text("first\n\nsecond\n\nthird");
    assert_eq!(doc.metadata.paragraph_count, Some(3));
    assert_eq!(doc.regions.len(), 1);
    assert!(matches!(&doc.regions[0].kind, RegionKind::Section { name } if name == "body"));
  }

  #[test]
  fn test_parse_text_normalizes_crlf() {
    let doc = parse_text("a\r\n\r\nb");
    assert_eq!(doc.content, "a\n\nb");
    assert_eq!(doc.metadata.paragraph_count, Some(2));
  }

  #[test]
  fn test_parse_markdown_sections() {
    let raw = "intro paragraph\n\n# Setup\n\nInstall the thing.\n\n# Usage\n\nRun the thing.\n";
    let doc = parse_markdown(raw);

    let names: Vec<_> = doc
      .regions
      .iter()
      .map(|r| match &r.kind {
        RegionKind::Section { name } => name.as_str(),
        _ => "?",
      })
      .collect();
    assert_eq!(names, vec!["body", "Setup", "Usage"]);
    assert_eq!(doc.metadata.title.as_deref(), Some("Setup"));
    assert!(doc.region_text(&doc.regions[1]).contains("Install the thing."));
  }

  #[test]
  fn test_parse_markdown_title_is_first_heading() {
    let doc = parse_markdown("# Quarterly Report\n\nNumbers went up.");
    assert_eq!(doc.metadata.title.as_deref(), Some("Quarterly Report"));
  }

  #[test]
  fn test_parse_markdown_hints_include_sections() {
    let doc = parse_markdown("# Alpha\n\ntext\n\n## Beta\n\nmore");
    let hints = doc.structural_hints();
    assert!(hints.contains(&"Alpha".to_string()));
    assert!(hints.contains(&"Beta".to_string()));
  }

  #[test]
  fn test_parse_markdown_empty() {
    let doc = parse_markdown("");
    assert!(doc.content.is_empty());
    assert!(doc.regions.is_empty());
  }
}
