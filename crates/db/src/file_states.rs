use arrow_array::{
  Array, BooleanArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
};
use chrono::{TimeZone, Utc};
use foldex_core::{FileState, ProcessingState};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::{DbError, FolderDb, Result, escape_sql};
use crate::schema::file_states_schema;

impl FolderDb {
  /// Record a file-state transition in the journal.
  ///
  /// The row becomes durable at the next `checkpoint`. Until then, reads
  /// merge the journal over the table, so callers always observe the
  /// latest transition.
  pub async fn record_file_state(&self, state: FileState) {
    let mut pending = self.pending_states.lock().await;
    pending.insert(state.file_path.clone(), state);
  }

  /// Current state for a file: journal first, then the table.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_file_state(&self, file_path: &str) -> Result<Option<FileState>> {
    {
      let pending = self.pending_states.lock().await;
      if let Some(state) = pending.get(file_path) {
        return Ok(Some(state.clone()));
      }
    }

    let table = self.file_states_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("file_path = '{}'", escape_sql(file_path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() > 0 {
        return Ok(Some(batch_to_file_state(batch, 0)?));
      }
    }
    Ok(None)
  }

  /// All file states, journal merged over the table.
  pub async fn list_file_states(&self) -> Result<Vec<FileState>> {
    let table = self.file_states_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut by_path: HashMap<String, FileState> = HashMap::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        let state = batch_to_file_state(&batch, i)?;
        by_path.insert(state.file_path.clone(), state);
      }
    }

    {
      let pending = self.pending_states.lock().await;
      for (path, state) in pending.iter() {
        by_path.insert(path.clone(), state.clone());
      }
    }

    let mut states: Vec<FileState> = by_path.into_values().collect();
    states.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(states)
  }

  /// `relative_path → content_hash` for files in state INDEXED.
  ///
  /// This is the "previous snapshot" side of change detection.
  pub async fn indexed_hashes(&self) -> Result<HashMap<String, String>> {
    let states = self.list_file_states().await?;
    Ok(
      states
        .into_iter()
        .filter(|s| s.state == ProcessingState::Indexed)
        .map(|s| (s.file_path, s.content_hash))
        .collect(),
    )
  }

  /// Drop a file's state row entirely (journal and table).
  pub async fn delete_file_state(&self, file_path: &str) -> Result<()> {
    {
      let mut pending = self.pending_states.lock().await;
      pending.remove(file_path);
    }
    let table = self.file_states_table().await?;
    table
      .delete(&format!("file_path = '{}'", escape_sql(file_path)))
      .await?;
    Ok(())
  }

  /// Flush journaled rows to the table. Returns the number flushed.
  pub(crate) async fn flush_pending_states(&self) -> Result<usize> {
    let states: Vec<FileState> = {
      let mut pending = self.pending_states.lock().await;
      pending.drain().map(|(_, s)| s).collect()
    };

    if states.is_empty() {
      return Ok(0);
    }

    let table = self.file_states_table().await?;

    // Delete-then-add upsert, one delete predicate for the whole batch.
    let path_list = states
      .iter()
      .map(|s| format!("'{}'", escape_sql(&s.file_path)))
      .collect::<Vec<_>>()
      .join(", ");
    let _ = table.delete(&format!("file_path IN ({path_list})")).await;

    let batch = file_states_to_batch(&states)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], file_states_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(states.len())
  }

  /// Startup recovery: every row stuck in PROCESSING is reset to PENDING
  /// so interrupted work is retried. Returns the number reset.
  #[tracing::instrument(level = "debug", skip(self))]
  pub async fn recover_interrupted(&self) -> Result<usize> {
    // Journal entries count too: flush so the scan sees everything.
    self.flush_pending_states().await?;

    let states = self.list_file_states().await?;
    let stuck: Vec<FileState> = states
      .into_iter()
      .filter(|s| s.state == ProcessingState::Processing)
      .collect();

    if stuck.is_empty() {
      return Ok(0);
    }

    let count = stuck.len();
    for mut state in stuck {
      debug!(file = %state.file_path, "Resetting interrupted file to pending");
      state.state = ProcessingState::Pending;
      self.record_file_state(state).await;
    }
    self.flush_pending_states().await?;

    info!(count, "Recovered interrupted files");
    Ok(count)
  }
}

fn file_states_to_batch(states: &[FileState]) -> Result<RecordBatch> {
  let paths: Vec<String> = states.iter().map(|s| s.file_path.clone()).collect();
  let hashes: Vec<String> = states.iter().map(|s| s.content_hash.clone()).collect();
  let kinds: Vec<String> = states.iter().map(|s| s.state.as_str().to_string()).collect();
  let attempts: Vec<u32> = states.iter().map(|s| s.attempt_count).collect();
  let last_attempts: Vec<i64> = states.iter().map(|s| s.last_attempt.timestamp_millis()).collect();
  let errors: Vec<Option<String>> = states.iter().map(|s| s.last_error.clone()).collect();
  let corrupted: Vec<bool> = states.iter().map(|s| s.corrupted).collect();
  let chunk_counts: Vec<Option<u32>> = states.iter().map(|s| s.chunk_count).collect();

  let batch = RecordBatch::try_new(
    file_states_schema(),
    vec![
      Arc::new(StringArray::from(paths)),
      Arc::new(StringArray::from(hashes)),
      Arc::new(StringArray::from(kinds)),
      Arc::new(UInt32Array::from(attempts)),
      Arc::new(Int64Array::from(last_attempts)),
      Arc::new(StringArray::from(errors)),
      Arc::new(BooleanArray::from(corrupted)),
      Arc::new(UInt32Array::from(chunk_counts)),
    ],
  )?;

  Ok(batch)
}

fn batch_to_file_state(batch: &RecordBatch, row: usize) -> Result<FileState> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let state: ProcessingState = get_string("state")?.parse().map_err(DbError::NotFound)?;

  let attempt_count = batch
    .column_by_name("attempt_count")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column attempt_count".to_string()))?;

  let last_attempt = batch
    .column_by_name("last_attempt")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column last_attempt".to_string()))?;

  let last_error = batch
    .column_by_name("last_error")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row).to_string()) });

  let corrupted = batch
    .column_by_name("corrupted")
    .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
    .map(|a| a.value(row))
    .unwrap_or(false);

  let chunk_count = batch
    .column_by_name("chunk_count")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) });

  Ok(FileState {
    file_path: get_string("file_path")?,
    content_hash: get_string("content_hash")?,
    state,
    attempt_count,
    last_attempt: Utc
      .timestamp_millis_opt(last_attempt)
      .single()
      .unwrap_or_else(Utc::now),
    last_error,
    corrupted,
    chunk_count,
  })
}
