//! OOXML parsers: Word, Spreadsheet, Presentation.
//!
//! All three formats are zip containers of XML parts; text is pulled
//! with a streaming reader rather than a full DOM.

use foldex_core::{DocumentMetadata, FileType};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};

use super::{ContentBuilder, ParseError, ParsedDocument, RegionKind};

/// Rows grouped into one spreadsheet region.
const ROWS_PER_REGION: u32 = 50;

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>, ParseError> {
  zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParseError::Corrupted(format!("not a zip container: {e}")))
}

fn read_part(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String, ParseError> {
  let mut file = archive
    .by_name(name)
    .map_err(|e| ParseError::Corrupted(format!("missing part {name}: {e}")))?;
  let mut xml = String::new();
  file
    .read_to_string(&mut xml)
    .map_err(|e| ParseError::Corrupted(format!("unreadable part {name}: {e}")))?;
  Ok(xml)
}

fn read_part_optional(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
  let mut file = archive.by_name(name).ok()?;
  let mut xml = String::new();
  file.read_to_string(&mut xml).ok()?;
  Some(xml)
}

fn xml_error(e: quick_xml::Error) -> ParseError {
  ParseError::Corrupted(format!("malformed xml: {e}"))
}

/// Word document: body text paragraph by paragraph, title/author from
/// the core properties part.
pub fn parse_docx(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let mut archive = open_archive(bytes)?;
  let xml = read_part(&mut archive, "word/document.xml")?;

  let mut reader = Reader::from_str(&xml);
  let mut body = String::new();
  let mut in_text = false;
  let mut paragraph_count = 0u32;

  loop {
    match reader.read_event().map_err(xml_error)? {
      Event::Start(ref e) => {
        if e.local_name().as_ref() == b"t" {
          in_text = true;
        }
      }
      Event::End(ref e) => match e.local_name().as_ref() {
        b"t" => in_text = false,
        b"p" => {
          if !body.ends_with("\n\n") && !body.is_empty() {
            body.push_str("\n\n");
          }
          paragraph_count += 1;
        }
        _ => {}
      },
      Event::Empty(ref e) => match e.local_name().as_ref() {
        b"tab" => body.push(' '),
        b"br" => body.push('\n'),
        _ => {}
      },
      Event::Text(ref t) => {
        if in_text {
          body.push_str(&t.unescape().map_err(xml_error)?);
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  let (title, author) = core_properties(&mut archive);

  let mut builder = ContentBuilder::new();
  builder.push_region(
    RegionKind::Section {
      name: "body".to_string(),
    },
    &body,
  );

  Ok(builder.finish(
    FileType::Word,
    DocumentMetadata {
      title,
      author,
      paragraph_count: Some(paragraph_count),
      ..Default::default()
    },
  ))
}

/// Spreadsheet: one region per contiguous row group per sheet, each row
/// rendered as its cell values joined with ` | `.
pub fn parse_xlsx(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let mut archive = open_archive(bytes)?;

  let shared = read_part_optional(&mut archive, "xl/sharedStrings.xml")
    .map(|xml| parse_shared_strings(&xml))
    .transpose()?
    .unwrap_or_default();

  let sheet_names = parse_sheet_names(&read_part(&mut archive, "xl/workbook.xml")?)?;

  let mut builder = ContentBuilder::new();
  for (i, sheet_name) in sheet_names.iter().enumerate() {
    let part = format!("xl/worksheets/sheet{}.xml", i + 1);
    let Some(xml) = read_part_optional(&mut archive, &part) else {
      continue;
    };

    let rows = parse_sheet_rows(&xml, &shared)?;
    for group in rows.chunks(ROWS_PER_REGION as usize) {
      let Some((first_row, _)) = group.first() else { continue };
      let Some((last_row, _)) = group.last() else { continue };
      let text = group.iter().map(|(_, line)| line.as_str()).collect::<Vec<_>>().join("\n");
      builder.push_region(
        RegionKind::Sheet {
          name: sheet_name.clone(),
          start_row: *first_row,
          end_row: *last_row,
        },
        &text,
      );
    }
  }

  let sheet_count = sheet_names.len() as u32;
  Ok(builder.finish(
    FileType::Spreadsheet,
    DocumentMetadata {
      sheet_count: Some(sheet_count),
      ..Default::default()
    },
  ))
}

/// Presentation: one region per slide.
pub fn parse_pptx(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let mut archive = open_archive(bytes)?;

  let mut builder = ContentBuilder::new();
  let mut slide_number = 0u32;

  loop {
    let part = format!("ppt/slides/slide{}.xml", slide_number + 1);
    let Some(xml) = read_part_optional(&mut archive, &part) else {
      break;
    };
    slide_number += 1;

    let mut reader = Reader::from_str(&xml);
    let mut text = String::new();
    let mut in_text = false;

    loop {
      match reader.read_event().map_err(xml_error)? {
        Event::Start(ref e) => {
          if e.local_name().as_ref() == b"t" {
            in_text = true;
          }
        }
        Event::End(ref e) => match e.local_name().as_ref() {
          b"t" => in_text = false,
          b"p" => text.push('\n'),
          _ => {}
        },
        Event::Text(ref t) => {
          if in_text {
            text.push_str(&t.unescape().map_err(xml_error)?);
          }
        }
        Event::Eof => break,
        _ => {}
      }
    }

    builder.push_region(RegionKind::Slide { number: slide_number }, &text);
  }

  if slide_number == 0 {
    return Err(ParseError::Corrupted("presentation has no slides".to_string()));
  }

  Ok(builder.finish(
    FileType::Presentation,
    DocumentMetadata {
      slide_count: Some(slide_number),
      ..Default::default()
    },
  ))
}

/// dc:title and dc:creator from docProps/core.xml, when present.
fn core_properties(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> (Option<String>, Option<String>) {
  let Some(xml) = read_part_optional(archive, "docProps/core.xml") else {
    return (None, None);
  };

  let mut reader = Reader::from_str(&xml);
  let mut title = None;
  let mut author = None;
  let mut current: Option<&str> = None;

  loop {
    match reader.read_event() {
      Ok(Event::Start(ref e)) => {
        current = match e.local_name().as_ref() {
          b"title" => Some("title"),
          b"creator" => Some("creator"),
          _ => None,
        };
      }
      Ok(Event::End(_)) => current = None,
      Ok(Event::Text(ref t)) => {
        if let Ok(text) = t.unescape() {
          let text = text.trim().to_string();
          if !text.is_empty() {
            match current {
              Some("title") => title = Some(text),
              Some("creator") => author = Some(text),
              _ => {}
            }
          }
        }
      }
      Ok(Event::Eof) | Err(_) => break,
      _ => {}
    }
  }

  (title, author)
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, ParseError> {
  let mut reader = Reader::from_str(xml);
  let mut strings = Vec::new();
  let mut current: Option<String> = None;
  let mut in_text = false;

  loop {
    match reader.read_event().map_err(xml_error)? {
      Event::Start(ref e) => match e.local_name().as_ref() {
        b"si" => current = Some(String::new()),
        b"t" => in_text = true,
        _ => {}
      },
      Event::End(ref e) => match e.local_name().as_ref() {
        b"si" => {
          if let Some(s) = current.take() {
            strings.push(s);
          }
        }
        b"t" => in_text = false,
        _ => {}
      },
      Event::Text(ref t) => {
        if in_text && let Some(s) = current.as_mut() {
          s.push_str(&t.unescape().map_err(xml_error)?);
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  Ok(strings)
}

fn parse_sheet_names(xml: &str) -> Result<Vec<String>, ParseError> {
  let mut reader = Reader::from_str(xml);
  let mut names = Vec::new();

  loop {
    match reader.read_event().map_err(xml_error)? {
      Event::Start(ref e) | Event::Empty(ref e) => {
        if e.local_name().as_ref() == b"sheet" {
          for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"name" {
              names.push(String::from_utf8_lossy(&attr.value).to_string());
            }
          }
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  if names.is_empty() {
    return Err(ParseError::Corrupted("workbook has no sheets".to_string()));
  }
  Ok(names)
}

/// Rows of a worksheet as (row_number, rendered_line).
fn parse_sheet_rows(xml: &str, shared: &[String]) -> Result<Vec<(u32, String)>, ParseError> {
  let mut reader = Reader::from_str(xml);
  let mut rows: Vec<(u32, String)> = Vec::new();

  let mut row_number = 0u32;
  let mut cells: Vec<String> = Vec::new();
  let mut cell_type: Option<String> = None;
  let mut in_value = false;
  let mut in_inline_text = false;

  loop {
    match reader.read_event().map_err(xml_error)? {
      Event::Start(ref e) => match e.local_name().as_ref() {
        b"row" => {
          row_number += 1;
          for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"r"
              && let Ok(n) = String::from_utf8_lossy(&attr.value).parse::<u32>()
            {
              row_number = n;
            }
          }
          cells.clear();
        }
        b"c" => {
          cell_type = None;
          for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"t" {
              cell_type = Some(String::from_utf8_lossy(&attr.value).to_string());
            }
          }
        }
        b"v" => in_value = true,
        b"t" => in_inline_text = true,
        _ => {}
      },
      Event::End(ref e) => match e.local_name().as_ref() {
        b"row" => {
          let line = cells.join(" | ");
          if !line.trim().is_empty() {
            rows.push((row_number, line));
          }
        }
        b"v" => in_value = false,
        b"t" => in_inline_text = false,
        _ => {}
      },
      Event::Text(ref t) => {
        let text = t.unescape().map_err(xml_error)?;
        if in_value {
          let value = if cell_type.as_deref() == Some("s") {
            text
              .trim()
              .parse::<usize>()
              .ok()
              .and_then(|i| shared.get(i).cloned())
              .unwrap_or_else(|| text.to_string())
          } else {
            text.to_string()
          };
          cells.push(value);
        } else if in_inline_text && cell_type.as_deref() == Some("inlineStr") {
          cells.push(text.to_string());
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  Ok(rows)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use zip::write::SimpleFileOptions;

  fn build_zip(parts: &[(&str, &str)]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
      let mut writer = zip::ZipWriter::new(&mut buffer);
      for (name, content) in parts {
        writer.start_file(name.to_string(), SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
      }
      writer.finish().unwrap();
    }
    buffer.into_inner()
  }

  #[test]
  fn test_parse_docx_paragraphs_and_props() {
    let document = r#"<?xml version="1.0"?>
<w:document xmlns:w="ns"><w:body>
<w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
<w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
</w:body></w:document>"#;
    let core = r#"<?xml version="1.0"?>
<cp:coreProperties xmlns:cp="ns" xmlns:dc="ns2"><dc:title>My Doc</dc:title><dc:creator>Ada</dc:creator></cp:coreProperties>"#;

    let bytes = build_zip(&[("word/document.xml", document), ("docProps/core.xml", core)]);
    let doc = parse_docx(&bytes).unwrap();

    assert!(doc.content.contains("First paragraph."));
    assert!(doc.content.contains("Second paragraph."));
    assert_eq!(doc.metadata.paragraph_count, Some(2));
    assert_eq!(doc.metadata.title.as_deref(), Some("My Doc"));
    assert_eq!(doc.metadata.author.as_deref(), Some("Ada"));
  }

  #[test]
  fn test_parse_xlsx_shared_strings_and_rows() {
    let workbook = r#"<workbook><sheets><sheet name="Budget" sheetId="1"/></sheets></workbook>"#;
    let strings = r#"<sst><si><t>Item</t></si><si><t>Widget</t></si></sst>"#;
    let sheet = r#"<worksheet><sheetData>
<row r="1"><c t="s"><v>0</v></c><c><v>100</v></c></row>
<row r="2"><c t="s"><v>1</v></c><c><v>250</v></c></row>
</sheetData></worksheet>"#;

    let bytes = build_zip(&[
      ("xl/workbook.xml", workbook),
      ("xl/sharedStrings.xml", strings),
      ("xl/worksheets/sheet1.xml", sheet),
    ]);
    let doc = parse_xlsx(&bytes).unwrap();

    assert_eq!(doc.metadata.sheet_count, Some(1));
    assert_eq!(doc.regions.len(), 1);
    match &doc.regions[0].kind {
      RegionKind::Sheet { name, start_row, end_row } => {
        assert_eq!(name, "Budget");
        assert_eq!(*start_row, 1);
        assert_eq!(*end_row, 2);
      }
      other => panic!("unexpected region {other:?}"),
    }
    assert!(doc.content.contains("Item | 100"));
    assert!(doc.content.contains("Widget | 250"));
  }

  #[test]
  fn test_parse_pptx_slides() {
    let slide1 = r#"<p:sld xmlns:a="ns"><a:p><a:r><a:t>Welcome</a:t></a:r></a:p></p:sld>"#;
    let slide2 = r#"<p:sld xmlns:a="ns"><a:p><a:r><a:t>Agenda</a:t></a:r></a:p></p:sld>"#;

    let bytes = build_zip(&[("ppt/slides/slide1.xml", slide1), ("ppt/slides/slide2.xml", slide2)]);
    let doc = parse_pptx(&bytes).unwrap();

    assert_eq!(doc.metadata.slide_count, Some(2));
    assert_eq!(doc.regions.len(), 2);
    assert!(matches!(doc.regions[0].kind, RegionKind::Slide { number: 1 }));
    assert!(doc.region_text(&doc.regions[0]).contains("Welcome"));
    assert!(doc.region_text(&doc.regions[1]).contains("Agenda"));
  }

  #[test]
  fn test_not_a_zip_is_corrupted() {
    assert!(matches!(parse_docx(b"plain bytes"), Err(ParseError::Corrupted(_))));
  }

  #[test]
  fn test_docx_missing_document_part() {
    let bytes = build_zip(&[("other.xml", "<x/>")]);
    assert!(matches!(parse_docx(&bytes), Err(ParseError::Corrupted(_))));
  }
}
