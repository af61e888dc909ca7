//! The abstract boundary to the backing data source.
//!
//! The engine never talks HTTP itself: consumers hand it an implementation
//! of [`DataSource`] and the cache/sync layers drive it through `fetch` and
//! `mutate`. Errors are classified so the sync queue can decide between
//! retry and permanent failure.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Mutation kinds dispatched through the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Operation::Create => write!(f, "create"),
      Operation::Update => write!(f, "update"),
      Operation::Delete => write!(f, "delete"),
    }
  }
}

/// Errors from the backing source, classified for retry policy.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
  /// Network errors, 5xx responses - worth retrying
  #[error("transient source error: {0}")]
  Transient(String),
  /// 4xx responses, validation failures - retrying won't help
  #[error("permanent source error: {0}")]
  Permanent(String),
  /// The request exceeded the configured timeout; treated as transient
  #[error("source request timed out after {0}ms")]
  Timeout(u64),
}

impl SourceError {
  /// Whether the sync queue should retry after this error.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SourceError::Transient(_) | SourceError::Timeout(_))
  }
}

/// Description of a detected write conflict: the server's current value
/// diverged from the value the local mutation assumed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConflictDescriptor {
  /// Server's current value for the entity
  pub server_value: Value,
  /// Fields where server and assumed base disagree, when the source knows
  pub conflict_fields: Vec<String>,
}

/// Outcome of a mutation dispatch.
#[derive(Debug, Clone)]
pub enum MutateOutcome {
  /// Mutation applied; the server's canonical value (Null for deletes)
  Applied(Value),
  /// Server state diverged from the assumed base
  Conflict(ConflictDescriptor),
}

/// The two operations the engine consumes from the application glue layer.
#[async_trait]
pub trait DataSource: Send + Sync {
  /// Read the current value for a cache key (cache miss / revalidation).
  async fn fetch(&self, key: &str) -> Result<Value, SourceError>;

  /// Push a mutation for a key; returns the server's value or a conflict.
  async fn mutate(
    &self,
    operation: Operation,
    key: &str,
    payload: &Value,
  ) -> Result<MutateOutcome, SourceError>;
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted in-memory source for queue and collection tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  /// One scripted reply, consumed in order. Once the script is exhausted the
  /// source echoes the payload back as `Applied`.
  #[derive(Debug, Clone)]
  pub enum Reply {
    Applied(Value),
    EchoPayload,
    Conflict(Value, Vec<String>),
    Transient(&'static str),
    Permanent(&'static str),
    Hang(Duration),
  }

  #[derive(Debug, Clone)]
  pub struct RecordedCall {
    pub operation: Operation,
    pub key: String,
    pub payload: Value,
  }

  #[derive(Default)]
  pub struct ScriptedSource {
    replies: Mutex<Vec<Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
    fetch_values: Mutex<HashMap<String, Value>>,
    in_flight_per_key: Mutex<HashMap<String, usize>>,
    max_in_flight_per_key: AtomicUsize,
    in_flight_global: AtomicUsize,
    max_in_flight_global: AtomicUsize,
    delay: Mutex<Option<Duration>>,
  }

  impl ScriptedSource {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn script(&self, replies: Vec<Reply>) {
      *self.replies.lock().unwrap() = replies;
    }

    pub fn set_fetch_value(&self, key: &str, value: Value) {
      self.fetch_values.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn set_delay(&self, delay: Duration) {
      *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
      self.calls.lock().unwrap().clone()
    }

    pub fn mutate_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    /// Highest number of concurrently in-flight mutations seen for any
    /// single key. The per-key ordering tests assert this stays at 1.
    pub fn max_in_flight_per_key(&self) -> usize {
      self.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently in-flight mutations across all keys.
    pub fn max_in_flight_global(&self) -> usize {
      self.max_in_flight_global.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
      let mut replies = self.replies.lock().unwrap();
      if replies.is_empty() {
        Reply::EchoPayload
      } else {
        replies.remove(0)
      }
    }
  }

  #[async_trait]
  impl DataSource for ScriptedSource {
    async fn fetch(&self, key: &str) -> Result<Value, SourceError> {
      self
        .fetch_values
        .lock()
        .unwrap()
        .get(key)
        .cloned()
        .ok_or_else(|| SourceError::Permanent(format!("no fetch value for {key}")))
    }

    async fn mutate(
      &self,
      operation: Operation,
      key: &str,
      payload: &Value,
    ) -> Result<MutateOutcome, SourceError> {
      {
        let mut per_key = self.in_flight_per_key.lock().unwrap();
        let count = per_key.entry(key.to_string()).or_insert(0);
        *count += 1;
        self.max_in_flight_per_key.fetch_max(*count, Ordering::SeqCst);

        let global = self.in_flight_global.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_global.fetch_max(global, Ordering::SeqCst);
      }

      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      self.calls.lock().unwrap().push(RecordedCall {
        operation,
        key: key.to_string(),
        payload: payload.clone(),
      });

      let reply = self.next_reply();

      let result = match reply {
        Reply::Applied(value) => Ok(MutateOutcome::Applied(value)),
        Reply::EchoPayload => Ok(MutateOutcome::Applied(payload.clone())),
        Reply::Conflict(server_value, conflict_fields) => {
          Ok(MutateOutcome::Conflict(ConflictDescriptor {
            server_value,
            conflict_fields,
          }))
        }
        Reply::Transient(msg) => Err(SourceError::Transient(msg.to_string())),
        Reply::Permanent(msg) => Err(SourceError::Permanent(msg.to_string())),
        Reply::Hang(duration) => {
          tokio::time::sleep(duration).await;
          Ok(MutateOutcome::Applied(payload.clone()))
        }
      };

      {
        let mut per_key = self.in_flight_per_key.lock().unwrap();
        if let Some(count) = per_key.get_mut(key) {
          *count -= 1;
        }
        self.in_flight_global.fetch_sub(1, Ordering::SeqCst);
      }

      result
    }
  }
}
