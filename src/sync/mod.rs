//! Ordered dispatch of pending mutations with retry and conflict handling.
//!
//! Optimistic mutations are applied locally first; the queue pushes them to
//! the backing source asynchronously, one at a time per key, and reports a
//! terminal [`SyncResult`] the collection layer reconciles or rolls back
//! against.

mod conflict;
mod queue;
mod task;

pub use conflict::{
  ConflictResolution, ConflictStrategy, LocalFieldsWin, MergePolicy, PendingConflict,
};
pub use queue::{SyncQueue, SyncQueueStats, TaskHandle};
pub use task::{SyncResult, SyncTask, TaskId, TaskStatus};

use thiserror::Error;

/// Errors surfaced by the sync and optimistic layers.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("sync queue is full ({0} tasks pending)")]
  QueueFull(usize),
  #[error("sync queue has shut down")]
  Closed,
  #[error("mutation failed permanently: {0}")]
  Failed(String),
  #[error("entity not found: {0}")]
  NotFound(String),
  #[error("invalid payload: {0}")]
  InvalidPayload(String),
  #[error("nothing to undo")]
  NothingToUndo,
}
