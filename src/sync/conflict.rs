//! Conflict resolution strategies for diverged writes.
//!
//! A conflict arises when the server's current value no longer matches the
//! base the optimistic mutation assumed. The queue routes it through the
//! configured strategy; only `prompt_user` requires the application to get
//! involved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::source::ConflictDescriptor;

/// How the sync queue resolves a diverged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
  /// Discard the local mutation, reconcile from the server value
  ServerWins,
  /// Re-apply the local mutation on top of the server's latest value
  ClientWins,
  /// Field-level merge via the queue's [`MergePolicy`]
  Merge,
  /// Surface the conflict to the caller; block the key until resolved
  PromptUser,
}

/// Resolution supplied by the application for a `prompt_user` conflict.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
  /// Keep the server's value, drop the local mutation
  UseServer,
  /// Re-submit the local mutation against the server's latest value
  UseLocal,
  /// Submit a caller-constructed value instead
  UseValue(Value),
}

/// A conflict waiting on application input, delivered on the queue's
/// conflict channel.
#[derive(Debug, Clone)]
pub struct PendingConflict {
  pub task_id: uuid::Uuid,
  pub target_key: String,
  pub descriptor: ConflictDescriptor,
}

/// Field-level merge of a local mutation onto the server's latest value.
///
/// The policy must be deterministic: given the same inputs it must produce
/// the same merged value, since retries may re-run it.
pub trait MergePolicy: Send + Sync {
  fn merge(&self, server_value: &Value, local_payload: &Value) -> Value;
}

/// Default merge policy: server fields not touched by the local mutation
/// are kept, touched fields keep the local value.
pub struct LocalFieldsWin;

impl MergePolicy for LocalFieldsWin {
  fn merge(&self, server_value: &Value, local_payload: &Value) -> Value {
    let mut merged = server_value.clone();

    match (merged.as_object_mut(), local_payload.as_object()) {
      (Some(base), Some(patch)) => {
        for (key, value) in patch {
          base.insert(key.clone(), value.clone());
        }
        merged
      }
      // Non-object payloads can't be merged field-wise; the local
      // mutation wins wholesale.
      _ => local_payload.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_untouched_server_fields_survive() {
    let server = json!({"id": "a1", "title": "server title", "notes": "server notes"});
    let local = json!({"title": "local title"});

    let merged = LocalFieldsWin.merge(&server, &local);
    assert_eq!(
      merged,
      json!({"id": "a1", "title": "local title", "notes": "server notes"})
    );
  }

  #[test]
  fn test_merge_is_deterministic() {
    let server = json!({"a": 1, "b": 2});
    let local = json!({"b": 3});

    let first = LocalFieldsWin.merge(&server, &local);
    let second = LocalFieldsWin.merge(&server, &local);
    assert_eq!(first, second);
  }

  #[test]
  fn test_non_object_payload_wins_wholesale() {
    let server = json!({"a": 1});
    let local = json!("replacement");

    assert_eq!(LocalFieldsWin.merge(&server, &local), json!("replacement"));
  }

  #[test]
  fn test_strategy_serde_names() {
    let strategy: ConflictStrategy = serde_yaml::from_str("server_wins").unwrap();
    assert_eq!(strategy, ConflictStrategy::ServerWins);

    let strategy: ConflictStrategy = serde_yaml::from_str("prompt_user").unwrap();
    assert_eq!(strategy, ConflictStrategy::PromptUser);
  }
}
