//! File-state decision logic.
//!
//! The durable state rows live in the folder store; this module holds
//! the pure decision rules the pipeline applies to them. Startup
//! recovery (PROCESSING → PENDING) lives on the store itself.

use foldex_core::{Decision, DecisionAction, FileState, ProcessingState};

/// Decide what to do with a file given its stored state and current
/// content hash. Rules are evaluated in order:
///
/// 1. No row → process (new file)
/// 2. INDEXED, same hash → skip (unchanged)
/// 3. INDEXED, different hash → process (modified)
/// 4. FAILED, corrupted → ignore
/// 5. FAILED, attempts remaining → retry
/// 6. FAILED, attempts exhausted → ignore
/// 7. PROCESSING → crashed earlier; process again
/// 8. Anything else (PENDING, SKIPPED, DELETED reappearing) → process
pub fn decide(existing: Option<&FileState>, current_hash: &str, max_retries: u32) -> Decision {
  let Some(row) = existing else {
    return Decision::new(DecisionAction::Process, "new file");
  };

  match row.state {
    ProcessingState::Indexed => {
      if row.content_hash == current_hash {
        Decision::new(DecisionAction::Skip, "unchanged")
      } else {
        Decision::new(DecisionAction::Process, "modified")
      }
    }
    ProcessingState::Failed => {
      if row.corrupted {
        Decision::new(DecisionAction::Ignore, "corrupted")
      } else if row.attempt_count < max_retries {
        Decision::new(DecisionAction::Retry, "previous attempt failed")
      } else {
        Decision::new(DecisionAction::Ignore, "retries exhausted")
      }
    }
    // A row stuck in PROCESSING means a crash; startup recovery resets
    // it, but a live job treats it as processable either way.
    ProcessingState::Processing => Decision::new(DecisionAction::Process, "interrupted"),
    ProcessingState::Pending => Decision::new(DecisionAction::Process, "pending"),
    ProcessingState::Skipped => {
      if row.content_hash == current_hash {
        Decision::new(DecisionAction::Skip, "previously skipped")
      } else {
        Decision::new(DecisionAction::Process, "modified since skip")
      }
    }
    ProcessingState::Deleted => Decision::new(DecisionAction::Process, "file reappeared"),
  }
}
