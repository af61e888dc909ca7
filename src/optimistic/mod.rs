//! Optimistic mutation layer: collections, undo, debounced updates.
//!
//! Mutations apply locally first and reconcile with the sync queue's
//! result afterwards; a failure reverts to the snapshot taken up front.

mod collection;
mod debounce;
mod undo;

pub use collection::{Collection, Tracked};
pub use debounce::{DebounceError, DebouncedUpdater};
pub use undo::{UndoAction, UndoManager, UndoRecord, DEFAULT_UNDO_CAPACITY};

use chrono::NaiveDate;

/// Clamp the end of a date range so it never precedes the start.
///
/// Used by entities in their `normalize` hook; a drag-resize can briefly
/// produce an inverted range, which must never reach the cache or the
/// dispatched payload.
pub fn clamp_end_date(start: NaiveDate, end: NaiveDate) -> NaiveDate {
  end.max(start)
}
