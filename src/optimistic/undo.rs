//! Shared undo stack for optimistic mutations.
//!
//! One manager is constructed at application start and handed to every
//! collection, so the stack is a single LIFO across all of them: an undo
//! triggered from one surface can undo an action issued by another. Each
//! record carries an erased handle back to its owning collection, which
//! replays the inverse through the normal optimistic path.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::sync::SyncError;

/// Default bound on retained undo records; the oldest is dropped first.
pub const DEFAULT_UNDO_CAPACITY: usize = 50;

/// What an undo must reverse.
#[derive(Debug, Clone)]
pub enum UndoAction {
  /// An entity was added; undo removes it
  Add { identity: String },
  /// An entity was removed; undo re-adds the snapshot
  Remove { snapshot: Value },
  /// An entity was updated; undo restores the prior fields
  Update { identity: String, prior: Value },
  /// A batch was updated; undo restores every prior
  BulkUpdate { priors: Vec<(String, Value)> },
}

/// Erased handle to the collection that owns an undo record.
pub(crate) trait UndoTarget: Send + Sync {
  fn replay_inverse(&self, action: UndoAction) -> BoxFuture<'static, Result<(), SyncError>>;
}

pub struct UndoRecord {
  pub id: u64,
  pub action: UndoAction,
  pub timestamp: DateTime<Utc>,
  target: Arc<dyn UndoTarget>,
}

struct UndoState {
  records: Vec<UndoRecord>,
  next_id: u64,
}

/// Process-wide bounded undo stack.
pub struct UndoManager {
  state: Mutex<UndoState>,
  capacity: usize,
}

impl Default for UndoManager {
  fn default() -> Self {
    Self::new()
  }
}

impl UndoManager {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_UNDO_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      state: Mutex::new(UndoState {
        records: Vec::new(),
        next_id: 0,
      }),
      capacity: capacity.max(1),
    }
  }

  pub fn can_undo(&self) -> bool {
    !self.state.lock().unwrap().records.is_empty()
  }

  pub fn len(&self) -> usize {
    self.state.lock().unwrap().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Action label of the most recent record, for UI affordances.
  pub fn last_action(&self) -> Option<UndoAction> {
    self
      .state
      .lock()
      .unwrap()
      .records
      .last()
      .map(|record| record.action.clone())
  }

  /// Pop the most recent record and replay its inverse through the owning
  /// collection. When the replay fails the record is restored, so the
  /// undo can be retried.
  pub async fn undo_last(&self) -> Result<(), SyncError> {
    let record = self
      .state
      .lock()
      .unwrap()
      .records
      .pop()
      .ok_or(SyncError::NothingToUndo)?;

    let result = record.target.replay_inverse(record.action.clone()).await;
    if result.is_err() {
      self.state.lock().unwrap().records.push(record);
    }
    result
  }

  /// Push a record for a just-applied optimistic mutation. Returns the
  /// record id for later amendment or discard.
  pub(crate) fn push(&self, action: UndoAction, target: Arc<dyn UndoTarget>) -> u64 {
    let mut state = self.state.lock().unwrap();
    let id = state.next_id;
    state.next_id += 1;

    state.records.push(UndoRecord {
      id,
      action,
      timestamp: Utc::now(),
      target,
    });
    if state.records.len() > self.capacity {
      state.records.remove(0);
    }

    id
  }

  /// Drop the record for a mutation that rolled back; its snapshot refers
  /// to a state that never committed.
  pub(crate) fn discard(&self, record_id: u64) {
    self
      .state
      .lock()
      .unwrap()
      .records
      .retain(|record| record.id != record_id);
  }

  /// Rewrite an `Add` record's identity once the server assigns the
  /// canonical id.
  pub(crate) fn amend_add_identity(&self, record_id: u64, new_identity: &str) {
    let mut state = self.state.lock().unwrap();
    if let Some(record) = state.records.iter_mut().find(|record| record.id == record_id) {
      if let UndoAction::Add { identity } = &mut record.action {
        *identity = new_identity.to_string();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingTarget {
    replays: AtomicUsize,
    fail: bool,
  }

  impl UndoTarget for CountingTarget {
    fn replay_inverse(&self, _action: UndoAction) -> BoxFuture<'static, Result<(), SyncError>> {
      self.replays.fetch_add(1, Ordering::SeqCst);
      let fail = self.fail;
      Box::pin(async move {
        if fail {
          Err(SyncError::Failed("remote rejected".into()))
        } else {
          Ok(())
        }
      })
    }
  }

  fn target(fail: bool) -> Arc<CountingTarget> {
    Arc::new(CountingTarget {
      replays: AtomicUsize::new(0),
      fail,
    })
  }

  #[tokio::test]
  async fn test_undo_pops_in_lifo_order() {
    let manager = UndoManager::new();
    let t = target(false);
    manager.push(UndoAction::Add { identity: "a".into() }, t.clone());
    manager.push(UndoAction::Add { identity: "b".into() }, t.clone());

    assert!(matches!(
      manager.last_action(),
      Some(UndoAction::Add { identity }) if identity == "b"
    ));
    manager.undo_last().await.unwrap();
    assert!(matches!(
      manager.last_action(),
      Some(UndoAction::Add { identity }) if identity == "a"
    ));
  }

  #[tokio::test]
  async fn test_empty_stack_reports_nothing_to_undo() {
    let manager = UndoManager::new();
    assert!(matches!(
      manager.undo_last().await,
      Err(SyncError::NothingToUndo)
    ));
  }

  #[tokio::test]
  async fn test_capacity_drops_oldest() {
    let manager = UndoManager::with_capacity(3);
    let t = target(false);
    for i in 0..5 {
      manager.push(
        UndoAction::Add {
          identity: format!("id-{i}"),
        },
        t.clone(),
      );
    }

    assert_eq!(manager.len(), 3);
    // Only the newest three survive
    manager.undo_last().await.unwrap();
    manager.undo_last().await.unwrap();
    manager.undo_last().await.unwrap();
    assert!(manager.is_empty());
  }

  #[tokio::test]
  async fn test_failed_undo_keeps_record() {
    let manager = UndoManager::new();
    manager.push(UndoAction::Add { identity: "a".into() }, target(true));

    assert!(manager.undo_last().await.is_err());
    assert_eq!(manager.len(), 1);
  }

  #[tokio::test]
  async fn test_discard_removes_by_id() {
    let manager = UndoManager::new();
    let t = target(false);
    let first = manager.push(UndoAction::Add { identity: "a".into() }, t.clone());
    manager.push(UndoAction::Add { identity: "b".into() }, t);

    manager.discard(first);
    assert_eq!(manager.len(), 1);
    assert!(matches!(
      manager.last_action(),
      Some(UndoAction::Add { identity }) if identity == "b"
    ));
  }

  #[tokio::test]
  async fn test_amend_rewrites_add_identity() {
    let manager = UndoManager::new();
    let id = manager.push(
      UndoAction::Add {
        identity: "temp-1".into(),
      },
      target(false),
    );

    manager.amend_add_identity(id, "server-9");
    assert!(matches!(
      manager.last_action(),
      Some(UndoAction::Add { identity }) if identity == "server-9"
    ));
  }
}
