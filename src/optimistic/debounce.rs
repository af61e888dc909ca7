//! Debounced update path for high-frequency mutations.
//!
//! A drag-resize emits dozens of updates per second; each one must show up
//! locally at once, but only the last state within the delay window is
//! worth sending. Patches within a burst are folded together per identity
//! and dispatched once the burst goes quiet. A failed dispatch restores
//! the pre-burst snapshot and reports on the error channel.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::collection::Collection;
use crate::cache::CacheStorage;
use crate::entity::Entity;
use crate::sync::SyncError;

/// A dispatch failure from a debounced burst.
#[derive(Debug)]
pub struct DebounceError {
  pub identity: String,
  pub error: SyncError,
}

struct Burst {
  /// Folded patch: last value per field across the burst
  patch: Map<String, Value>,
  /// Snapshot from before the first patch of the burst
  prior: Value,
  generation: u64,
}

/// Debounces remote dispatch of per-entity update bursts.
pub struct DebouncedUpdater<T: Entity, S: CacheStorage + 'static> {
  collection: Collection<T, S>,
  delay: Duration,
  bursts: Arc<Mutex<HashMap<String, Burst>>>,
  error_tx: mpsc::UnboundedSender<DebounceError>,
  error_rx: Mutex<Option<mpsc::UnboundedReceiver<DebounceError>>>,
}

impl<T: Entity, S: CacheStorage + 'static> DebouncedUpdater<T, S> {
  pub fn new(collection: Collection<T, S>, delay: Duration) -> Self {
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    Self {
      collection,
      delay,
      bursts: Arc::new(Mutex::new(HashMap::new())),
      error_tx,
      error_rx: Mutex::new(Some(error_rx)),
    }
  }

  /// Take the error channel; callable once.
  pub fn errors(&self) -> Option<mpsc::UnboundedReceiver<DebounceError>> {
    self.error_rx.lock().unwrap().take()
  }

  /// Number of identities with a burst still waiting to dispatch.
  pub fn pending(&self) -> usize {
    self.bursts.lock().unwrap().len()
  }

  /// Apply a patch locally right now; the remote dispatch fires only when
  /// no further patch for this identity arrives within the delay window.
  ///
  /// The patch that is cached and dispatched is re-read from the
  /// normalized entity, so entity invariants (like a clamped date range)
  /// hold in both places.
  pub fn submit(&self, identity: &str, patch: Value) -> Result<(), SyncError> {
    let (normalized_patch, prior) = self.collection.apply_local(identity, &patch)?;

    let generation = {
      let mut bursts = self.bursts.lock().unwrap();
      let burst = bursts.entry(identity.to_string()).or_insert_with(|| Burst {
        patch: Map::new(),
        prior,
        generation: 0,
      });
      if let Some(fields) = normalized_patch.as_object() {
        for (key, value) in fields {
          burst.patch.insert(key.clone(), value.clone());
        }
      }
      burst.generation += 1;
      burst.generation
    };

    let collection = self.collection.clone();
    let bursts = Arc::clone(&self.bursts);
    let error_tx = self.error_tx.clone();
    let delay = self.delay;
    let identity = identity.to_string();

    tokio::spawn(async move {
      tokio::time::sleep(delay).await;

      // Only the spawn belonging to the last patch of the burst dispatches
      let burst = {
        let mut bursts = bursts.lock().unwrap();
        match bursts.get(&identity) {
          Some(burst) if burst.generation == generation => bursts.remove(&identity),
          _ => None,
        }
      };
      let Some(burst) = burst else { return };

      let patch = Value::Object(burst.patch);
      if let Err(error) = collection.dispatch_patch(&identity, patch).await {
        collection.restore_snapshot(&identity, burst.prior);
        let _ = error_tx.send(DebounceError { identity, error });
      }
    });

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopStorage, TieredCache};
  use crate::config::{AdaptiveConfig, SyncConfig};
  use super::super::undo::UndoManager;
  use crate::optimistic::clamp_end_date;
  use crate::perf::{MetricRecorder, PerformanceOptimizer};
  use crate::source::testing::{Reply, ScriptedSource};
  use crate::sync::{LocalFieldsWin, SyncQueue};
  use chrono::NaiveDate;
  use serde::{Deserialize, Serialize};
  use serde_json::json;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Activity {
    id: String,
    title: String,
    activity_date: NaiveDate,
    end_date: NaiveDate,
  }

  impl Entity for Activity {
    fn identity(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "activity"
    }

    fn normalize(&mut self) {
      self.end_date = clamp_end_date(self.activity_date, self.end_date);
    }
  }

  fn activity(id: &str) -> Activity {
    Activity {
      id: id.to_string(),
      title: "Farm visit".to_string(),
      activity_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
      end_date: NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
    }
  }

  struct Fixture {
    source: Arc<ScriptedSource>,
    collection: Collection<Activity, NoopStorage>,
    updater: DebouncedUpdater<Activity, NoopStorage>,
  }

  const KEY: &str = "activities:trip-1";

  async fn seeded(initial: Vec<Activity>, delay: Duration) -> Fixture {
    let mut base = SyncConfig::development();
    base.sync.sync_interval_ms = 50;

    let recorder = Arc::new(MetricRecorder::new());
    let config = Arc::new(AdaptiveConfig::new(
      base,
      Arc::new(PerformanceOptimizer::new(recorder.clone())),
    ));
    let source = Arc::new(ScriptedSource::new());
    let queue = SyncQueue::with_options(
      source.clone(),
      config.clone(),
      recorder.clone(),
      Box::new(LocalFieldsWin),
      Duration::from_millis(2),
    );
    let cache: TieredCache<Vec<Activity>, NoopStorage> =
      TieredCache::new("activities", NoopStorage, config, recorder);
    let collection = Collection::new(
      KEY,
      cache,
      queue,
      Arc::new(UndoManager::new()),
      source.clone(),
    );

    source.set_fetch_value(KEY, serde_json::to_value(&initial).unwrap());
    collection.load().await.unwrap();

    Fixture {
      source,
      updater: DebouncedUpdater::new(collection.clone(), delay),
      collection,
    }
  }

  #[tokio::test]
  async fn test_local_apply_is_immediate() {
    let f = seeded(vec![activity("a1")], Duration::from_millis(60)).await;

    f.updater
      .submit("a1", json!({"title": "Cupping session"}))
      .unwrap();

    let items = f.collection.snapshot();
    assert_eq!(items[0].item.title, "Cupping session");
    assert!(items[0].optimistic);
    assert_eq!(f.source.mutate_count(), 0);
  }

  #[tokio::test]
  async fn test_burst_dispatches_only_the_last_state() {
    let f = seeded(vec![activity("a1")], Duration::from_millis(40)).await;

    f.updater.submit("a1", json!({"title": "v1"})).unwrap();
    f.updater.submit("a1", json!({"title": "v2"})).unwrap();
    f.updater.submit("a1", json!({"title": "v3"})).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(f.source.mutate_count(), 1);
    let calls = f.source.calls();
    assert_eq!(calls[0].payload["title"], json!("v3"));

    let items = f.collection.snapshot();
    assert_eq!(items[0].item.title, "v3");
    assert!(!items[0].optimistic);
  }

  #[tokio::test]
  async fn test_burst_folds_fields_across_patches() {
    let f = seeded(vec![activity("a1")], Duration::from_millis(40)).await;

    f.updater.submit("a1", json!({"title": "Renamed"})).unwrap();
    f.updater
      .submit("a1", json!({"activity_date": "2025-03-08"}))
      .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(f.source.mutate_count(), 1);
    let payload = &f.source.calls()[0].payload;
    assert_eq!(payload["title"], json!("Renamed"));
    assert_eq!(payload["activity_date"], json!("2025-03-08"));
  }

  #[tokio::test]
  async fn test_identities_debounce_independently() {
    let f = seeded(
      vec![activity("a1"), activity("a2")],
      Duration::from_millis(30),
    )
    .await;

    f.updater.submit("a1", json!({"title": "one"})).unwrap();
    f.updater.submit("a2", json!({"title": "two"})).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(f.source.mutate_count(), 2);
  }

  #[tokio::test]
  async fn test_inverted_date_range_is_clamped_everywhere() {
    let f = seeded(vec![activity("a1")], Duration::from_millis(20)).await;

    f.updater
      .submit(
        "a1",
        json!({"activity_date": "2025-03-10", "end_date": "2025-03-05"}),
      )
      .unwrap();

    // Clamped in the cache immediately
    let items = f.collection.snapshot();
    assert_eq!(
      items[0].item.end_date,
      NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    );
    assert!(items[0].item.end_date >= items[0].item.activity_date);

    // And in the dispatched payload
    tokio::time::sleep(Duration::from_millis(120)).await;
    let payload = &f.source.calls()[0].payload;
    assert_eq!(payload["end_date"], json!("2025-03-10"));
    assert_eq!(payload["activity_date"], json!("2025-03-10"));
  }

  #[tokio::test]
  async fn test_failed_dispatch_restores_pre_burst_snapshot() {
    let f = seeded(vec![activity("a1")], Duration::from_millis(20)).await;
    let mut errors = f.updater.errors().unwrap();
    f.source.script(vec![Reply::Permanent("422")]);

    f.updater.submit("a1", json!({"title": "doomed"})).unwrap();
    f.updater.submit("a1", json!({"title": "doomed v2"})).unwrap();

    let error = errors.recv().await.unwrap();
    assert_eq!(error.identity, "a1");

    let items = f.collection.snapshot();
    assert_eq!(items[0].item.title, "Farm visit");
    assert!(!items[0].optimistic);
  }

  #[tokio::test]
  async fn test_unknown_identity_is_rejected_up_front() {
    let f = seeded(vec![], Duration::from_millis(20)).await;
    assert!(matches!(
      f.updater.submit("ghost", json!({"title": "x"})),
      Err(SyncError::NotFound(_))
    ));
  }
}
