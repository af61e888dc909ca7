//! Sync task model and state machine.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

use crate::source::{ConflictDescriptor, Operation};

pub type TaskId = Uuid;

/// Lifecycle state of a queued mutation.
///
/// `Pending → InFlight → Succeeded` is the happy path; transient failures
/// loop back to `Pending` with `attempts` incremented until the retry
/// budget runs out. `AwaitingResolution` holds `prompt_user` conflicts
/// until the application resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  InFlight,
  AwaitingResolution,
  Succeeded,
  FailedPermanently,
}

/// A pending mutation against the backing source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncTask {
  pub id: TaskId,
  /// Cache key this task will reconcile; also the per-key ordering unit
  pub target_key: String,
  pub operation: Operation,
  pub payload: Value,
  /// Dispatch attempts so far (incremented on every dispatch)
  pub attempts: u32,
  pub status: TaskStatus,
  pub enqueued_at: DateTime<Utc>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  /// Earliest moment the next dispatch may happen (backoff); not
  /// persisted, a reloaded task is immediately eligible
  #[serde(skip)]
  pub(crate) next_retry: Option<Instant>,
  /// Conflict details while the task sits in `AwaitingResolution`
  pub(crate) conflict: Option<ConflictDescriptor>,
}

impl SyncTask {
  pub fn new(operation: Operation, target_key: &str, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      target_key: target_key.to_string(),
      operation,
      payload,
      attempts: 0,
      status: TaskStatus::Pending,
      enqueued_at: Utc::now(),
      last_attempt_at: None,
      next_retry: None,
      conflict: None,
    }
  }

  /// Whether the task may be dispatched now.
  pub(crate) fn is_ready(&self, now: Instant) -> bool {
    self.status == TaskStatus::Pending && self.next_retry.map_or(true, |at| at <= now)
  }
}

/// Terminal outcome of a sync task, delivered to the enqueueing caller.
#[derive(Debug, Clone)]
pub enum SyncResult {
  /// Mutation applied; the server's canonical value (Null for deletes)
  Committed { value: Value },
  /// A conflict was resolved by discarding the local mutation; the cache
  /// must be reconciled from this server value
  Overridden { value: Value },
  /// Permanent failure; the optimistic mutation must be rolled back
  Failed { error: String },
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_new_task_is_pending_and_ready() {
    let task = SyncTask::new(Operation::Create, "participant:p1", serde_json::json!({}));

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert!(task.is_ready(Instant::now()));
  }

  #[test]
  fn test_backoff_delays_readiness() {
    let mut task = SyncTask::new(Operation::Update, "participant:p1", serde_json::json!({}));
    task.next_retry = Some(Instant::now() + Duration::from_secs(60));

    assert!(!task.is_ready(Instant::now()));
  }

  #[test]
  fn test_ids_are_unique() {
    let a = SyncTask::new(Operation::Create, "k", Value::Null);
    let b = SyncTask::new(Operation::Create, "k", Value::Null);
    assert_ne!(a.id, b.id);
  }
}
