//! Human and JSON output for tool envelopes.

use serde_json::Value;

/// Print an envelope either as raw JSON or in a readable form. Returns
/// the process exit code (0 on success, 1 on error).
pub fn print_envelope(envelope: &Value, json: bool) -> i32 {
  let code = envelope
    .pointer("/status/code")
    .and_then(Value::as_str)
    .unwrap_or("error");

  if json {
    println!("{}", serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".to_string()));
    return if code == "error" { 1 } else { 0 };
  }

  if code == "error" {
    let message = envelope
      .pointer("/status/message")
      .and_then(Value::as_str)
      .unwrap_or("unknown error");
    eprintln!("error: {message}");
    return 1;
  }

  let data = envelope.get("data").unwrap_or(&Value::Null);
  if let Some(results) = data.get("results").and_then(Value::as_array) {
    print_search_results(results);
  } else if let Some(folders) = data.get("folders").and_then(Value::as_array) {
    print_folders(folders);
  } else {
    println!("{}", serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string()));
  }

  if envelope
    .pointer("/continuation/has_more")
    .and_then(Value::as_bool)
    .unwrap_or(false)
    && let Some(token) = envelope.pointer("/continuation/token").and_then(Value::as_str)
  {
    eprintln!("(more results available; continue with --token {token})");
  }

  0
}

fn print_search_results(results: &[Value]) {
  if results.is_empty() {
    println!("no results");
    return;
  }

  for (i, hit) in results.iter().enumerate() {
    let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    let document = hit.get("document_id").and_then(Value::as_str).unwrap_or("?");
    let location = hit.get("location").and_then(Value::as_str).unwrap_or("");
    let content = hit.get("content").and_then(Value::as_str).unwrap_or("");

    println!("{}. {document} ({location}) score={score:.3}", i + 1);
    let preview: String = content.chars().take(160).collect();
    println!("   {}", preview.replace('\n', " "));
  }
}

fn print_folders(folders: &[Value]) {
  for folder in folders {
    let name = folder.get("name").and_then(Value::as_str).unwrap_or("?");
    let path = folder.get("path").and_then(Value::as_str).unwrap_or("?");
    let count = folder.get("document_count").and_then(Value::as_u64).unwrap_or(0);
    let model = folder.get("model").and_then(Value::as_str).unwrap_or("?");
    println!("{name}\t{path}\t{count} documents\t{model}");
  }
}
