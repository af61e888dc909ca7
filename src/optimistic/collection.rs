//! Optimistic collection handle over the cache and sync queue.
//!
//! Every mutation applies to the in-memory collection immediately, writes
//! through to the tiered cache, and enqueues the remote mutation. When the
//! remote side ultimately fails the local change is reverted from the
//! snapshot taken up front, and the undo record pushed for the mutation is
//! discarded with it.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::undo::{UndoAction, UndoManager, UndoTarget};
use crate::cache::{CacheStorage, TieredCache};
use crate::entity::{apply_patch, extract_fields, Entity};
use crate::source::{DataSource, Operation};
use crate::sync::{SyncError, SyncQueue, SyncResult};

/// A collection item with its optimistic flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
  pub item: T,
  /// True while the mutation that produced this state is still in flight
  pub optimistic: bool,
}

struct CollectionInner<T, S: CacheStorage> {
  /// Cache key for the whole collection (e.g. "participants:trip-1")
  key: String,
  items: Mutex<Vec<Tracked<T>>>,
  cache: TieredCache<Vec<T>, S>,
  queue: SyncQueue,
  undo: Arc<UndoManager>,
  source: Arc<dyn DataSource>,
}

/// Shared handle to an optimistically-mutated collection of entities.
///
/// Clones share state; constructed once per resource collection with the
/// process-wide queue, undo manager and cache dependencies injected.
pub struct Collection<T: Entity, S: CacheStorage> {
  inner: Arc<CollectionInner<T, S>>,
}

impl<T: Entity, S: CacheStorage + 'static> Collection<T, S> {
  pub fn new(
    key: &str,
    cache: TieredCache<Vec<T>, S>,
    queue: SyncQueue,
    undo: Arc<UndoManager>,
    source: Arc<dyn DataSource>,
  ) -> Self {
    Self {
      inner: Arc::new(CollectionInner {
        key: key.to_string(),
        items: Mutex::new(Vec::new()),
        cache,
        queue,
        undo,
        source,
      }),
    }
  }

  /// Load the collection through the cache (stale-while-revalidate).
  pub async fn load(&self) -> color_eyre::Result<Vec<Tracked<T>>> {
    let source = Arc::clone(&self.inner.source);
    let key = self.inner.key.clone();

    let read = self
      .inner
      .cache
      .get_or_fetch(&self.inner.key, move || async move {
        let value = source
          .fetch(&key)
          .await
          .map_err(|e| color_eyre::eyre::eyre!("Failed to fetch {}: {}", key, e))?;
        serde_json::from_value::<Vec<T>>(value)
          .map_err(|e| color_eyre::eyre::eyre!("Failed to decode {}: {}", key, e))
      })
      .await?;

    {
      let mut items = self.inner.items.lock().unwrap();
      *items = read
        .data
        .into_iter()
        .map(|item| Tracked {
          item,
          optimistic: false,
        })
        .collect();
    }

    Ok(self.snapshot())
  }

  pub fn snapshot(&self) -> Vec<Tracked<T>> {
    self.inner.items.lock().unwrap().clone()
  }

  pub fn len(&self) -> usize {
    self.inner.items.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn undo_manager(&self) -> &Arc<UndoManager> {
    &self.inner.undo
  }

  pub fn can_undo(&self) -> bool {
    self.inner.undo.can_undo()
  }

  /// Undo the most recent action on the shared stack. The inverse runs
  /// through the same optimistic path, so it can itself fail and roll
  /// back.
  pub async fn undo_last(&self) -> Result<(), SyncError> {
    self.inner.undo.undo_last().await
  }

  /// Add an entity optimistically.
  ///
  /// When an item with the same identity already exists it is updated in
  /// place instead of inserted twice. Returns the reconciled entity with
  /// any server-assigned fields applied.
  pub async fn add(&self, item: T) -> Result<T, SyncError> {
    self.add_internal(item, true).await
  }

  /// Update an entity with a JSON field patch.
  pub async fn update(&self, identity: &str, patch: Value) -> Result<T, SyncError> {
    self.update_internal(identity, patch, true).await
  }

  /// Remove an entity optimistically.
  pub async fn remove(&self, identity: &str) -> Result<(), SyncError> {
    self.remove_internal(identity, true).await
  }

  /// Apply one patch across a batch of entities as a single undoable
  /// action. The local apply is all-or-nothing: any remote failure rolls
  /// every item back to its prior state.
  pub async fn bulk_update(&self, identities: &[String], patch: Value) -> Result<(), SyncError> {
    // Validate and stage everything before touching state
    let mut staged: Vec<(String, Value, T, Value)> = Vec::new();
    {
      let items = self.inner.items.lock().unwrap();
      for identity in identities {
        let index = Self::position(&items, identity)
          .ok_or_else(|| SyncError::NotFound(identity.clone()))?;
        let prior_value = serde_json::to_value(&items[index].item)
          .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        let patched = apply_patch(&items[index].item, &patch)
          .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        let dispatch_patch = extract_fields(&patched, &patch)
          .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        staged.push((identity.clone(), prior_value, patched, dispatch_patch));
      }
    }

    let priors: Vec<(String, Value)> = staged
      .iter()
      .map(|(identity, prior, _, _)| (identity.clone(), prior.clone()))
      .collect();

    {
      let mut items = self.inner.items.lock().unwrap();
      for (identity, _, patched, _) in &staged {
        if let Some(index) = Self::position(&items, identity) {
          items[index] = Tracked {
            item: patched.clone(),
            optimistic: true,
          };
        }
      }
      self.write_through(&items);
    }

    let record_id = self.inner.undo.push(
      UndoAction::BulkUpdate {
        priors: priors.clone(),
      },
      Arc::new(self.clone()),
    );

    let dispatches = staged
      .iter()
      .map(|(identity, _, _, dispatch_patch)| {
        self.dispatch(Operation::Update, identity, dispatch_patch.clone())
      })
      .collect::<Vec<_>>();
    let outcomes = futures::future::join_all(dispatches).await;

    let mut first_error: Option<SyncError> = None;
    for (outcome, (identity, ..)) in outcomes.into_iter().zip(&staged) {
      match outcome {
        Ok(SyncResult::Committed { value }) | Ok(SyncResult::Overridden { value }) => {
          self.reconcile_existing(identity, value);
        }
        Ok(SyncResult::Failed { error }) => {
          first_error.get_or_insert(SyncError::Failed(error));
        }
        Err(error) => {
          first_error.get_or_insert(error);
        }
      }
    }

    match first_error {
      None => Ok(()),
      Some(error) => {
        // All-or-nothing: restore every prior, including items whose own
        // dispatch happened to succeed
        {
          let mut items = self.inner.items.lock().unwrap();
          for (identity, prior) in &priors {
            if let Some(index) = Self::position(&items, identity) {
              match serde_json::from_value::<T>(prior.clone()) {
                Ok(item) => {
                  items[index] = Tracked {
                    item,
                    optimistic: false,
                  };
                }
                Err(e) => warn!("Failed to restore prior for {}: {}", identity, e),
              }
            }
          }
          self.write_through(&items);
        }
        self.inner.undo.discard(record_id);
        Err(error)
      }
    }
  }

  async fn add_internal(&self, mut item: T, push_undo: bool) -> Result<T, SyncError> {
    item.normalize();
    let identity = item.identity();
    let payload =
      serde_json::to_value(&item).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

    // Optimistic apply; a duplicate identity updates in place
    let replaced: Option<Tracked<T>> = {
      let mut items = self.inner.items.lock().unwrap();
      let replaced = match Self::position(&items, &identity) {
        Some(index) => {
          let prior = items[index].clone();
          items[index] = Tracked {
            item: item.clone(),
            optimistic: true,
          };
          Some(prior)
        }
        None => {
          items.push(Tracked {
            item: item.clone(),
            optimistic: true,
          });
          None
        }
      };
      self.write_through(&items);
      replaced
    };

    let record_id = if push_undo {
      Some(self.inner.undo.push(
        UndoAction::Add {
          identity: identity.clone(),
        },
        Arc::new(self.clone()),
      ))
    } else {
      None
    };

    let failure = match self.dispatch(Operation::Create, &identity, payload).await {
      Ok(SyncResult::Committed { value }) | Ok(SyncResult::Overridden { value }) => {
        let final_item = self.reconcile_at(&identity, value, item);
        let final_identity = final_item.identity();
        if final_identity != identity {
          if let Some(record_id) = record_id {
            self.inner.undo.amend_add_identity(record_id, &final_identity);
          }
        }
        return Ok(final_item);
      }
      Ok(SyncResult::Failed { error }) => SyncError::Failed(error),
      Err(error) => error,
    };

    // Rollback: restore the prior item, or drop the inserted one
    {
      let mut items = self.inner.items.lock().unwrap();
      match (Self::position(&items, &identity), replaced) {
        (Some(index), Some(prior)) => items[index] = prior,
        (Some(index), None) => {
          items.remove(index);
        }
        (None, _) => {}
      }
      self.write_through(&items);
    }
    if let Some(record_id) = record_id {
      self.inner.undo.discard(record_id);
    }

    Err(failure)
  }

  async fn update_internal(
    &self,
    identity: &str,
    patch: Value,
    push_undo: bool,
  ) -> Result<T, SyncError> {
    let (prior, dispatch_patch) = {
      let mut items = self.inner.items.lock().unwrap();
      let index =
        Self::position(&items, identity).ok_or_else(|| SyncError::NotFound(identity.into()))?;
      let prior = items[index].clone();
      let patched =
        apply_patch(&prior.item, &patch).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
      let dispatch_patch = extract_fields(&patched, &patch)
        .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

      items[index] = Tracked {
        item: patched,
        optimistic: true,
      };
      self.write_through(&items);
      (prior, dispatch_patch)
    };

    let record_id = if push_undo {
      let prior_value = serde_json::to_value(&prior.item)
        .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
      Some(self.inner.undo.push(
        UndoAction::Update {
          identity: identity.to_string(),
          prior: prior_value,
        },
        Arc::new(self.clone()),
      ))
    } else {
      None
    };

    let failure = match self.dispatch(Operation::Update, identity, dispatch_patch).await {
      Ok(SyncResult::Committed { value }) | Ok(SyncResult::Overridden { value }) => {
        self.reconcile_existing(identity, value);
        let items = self.inner.items.lock().unwrap();
        let index =
          Self::position(&items, identity).ok_or_else(|| SyncError::NotFound(identity.into()))?;
        return Ok(items[index].item.clone());
      }
      Ok(SyncResult::Failed { error }) => SyncError::Failed(error),
      Err(error) => error,
    };

    {
      let mut items = self.inner.items.lock().unwrap();
      if let Some(index) = Self::position(&items, identity) {
        items[index] = prior;
      }
      self.write_through(&items);
    }
    if let Some(record_id) = record_id {
      self.inner.undo.discard(record_id);
    }

    Err(failure)
  }

  async fn remove_internal(&self, identity: &str, push_undo: bool) -> Result<(), SyncError> {
    let (index, prior) = {
      let mut items = self.inner.items.lock().unwrap();
      let index =
        Self::position(&items, identity).ok_or_else(|| SyncError::NotFound(identity.into()))?;
      let prior = items.remove(index);
      self.write_through(&items);
      (index, prior)
    };

    let record_id = if push_undo {
      let snapshot = serde_json::to_value(&prior.item)
        .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
      Some(
        self
          .inner
          .undo
          .push(UndoAction::Remove { snapshot }, Arc::new(self.clone())),
      )
    } else {
      None
    };

    let failure = match self.dispatch(Operation::Delete, identity, Value::Null).await {
      Ok(SyncResult::Committed { .. }) => return Ok(()),
      Ok(SyncResult::Overridden { value }) => {
        // The server kept the entity; reflect its value instead of the
        // delete and drop the now-meaningless undo record
        if let Ok(mut item) = serde_json::from_value::<T>(value) {
          item.normalize();
          let mut items = self.inner.items.lock().unwrap();
          let index = index.min(items.len());
          items.insert(
            index,
            Tracked {
              item,
              optimistic: false,
            },
          );
          self.write_through(&items);
          if let Some(record_id) = record_id {
            self.inner.undo.discard(record_id);
          }
        }
        return Ok(());
      }
      Ok(SyncResult::Failed { error }) => SyncError::Failed(error),
      Err(error) => error,
    };

    {
      let mut items = self.inner.items.lock().unwrap();
      let index = index.min(items.len());
      items.insert(index, prior);
      self.write_through(&items);
    }
    if let Some(record_id) = record_id {
      self.inner.undo.discard(record_id);
    }

    Err(failure)
  }

  /// Apply a patch locally without dispatching, for the debounced path.
  /// Returns the normalized dispatch patch and the prior snapshot.
  pub(crate) fn apply_local(
    &self,
    identity: &str,
    patch: &Value,
  ) -> Result<(Value, Value), SyncError> {
    let mut items = self.inner.items.lock().unwrap();
    let index =
      Self::position(&items, identity).ok_or_else(|| SyncError::NotFound(identity.into()))?;

    let prior_value = serde_json::to_value(&items[index].item)
      .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
    let patched =
      apply_patch(&items[index].item, patch).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
    let dispatch_patch =
      extract_fields(&patched, patch).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

    items[index] = Tracked {
      item: patched,
      optimistic: true,
    };
    self.write_through(&items);

    Ok((dispatch_patch, prior_value))
  }

  /// Dispatch an already-applied patch, reconciling on success. The
  /// caller owns rollback on failure (the debounced path holds the
  /// pre-burst snapshot).
  pub(crate) async fn dispatch_patch(&self, identity: &str, patch: Value) -> Result<(), SyncError> {
    match self.dispatch(Operation::Update, identity, patch).await {
      Ok(SyncResult::Committed { value }) | Ok(SyncResult::Overridden { value }) => {
        self.reconcile_existing(identity, value);
        Ok(())
      }
      Ok(SyncResult::Failed { error }) => Err(SyncError::Failed(error)),
      Err(error) => Err(error),
    }
  }

  /// Restore an entity to a snapshot taken before an optimistic burst.
  pub(crate) fn restore_snapshot(&self, identity: &str, prior: Value) {
    match serde_json::from_value::<T>(prior) {
      Ok(item) => {
        let mut items = self.inner.items.lock().unwrap();
        if let Some(index) = Self::position(&items, identity) {
          items[index] = Tracked {
            item,
            optimistic: false,
          };
        }
        self.write_through(&items);
      }
      Err(e) => warn!("Failed to restore snapshot for {}: {}", identity, e),
    }
  }

  async fn dispatch(
    &self,
    operation: Operation,
    identity: &str,
    payload: Value,
  ) -> Result<SyncResult, SyncError> {
    let target_key = format!("{}:{}", T::entity_type(), identity);
    let handle = self.inner.queue.enqueue(operation, &target_key, payload)?;
    handle.result().await
  }

  /// Replace the item at `identity` with the server's value, falling back
  /// to the local item when the server returned nothing usable.
  fn reconcile_at(&self, identity: &str, server_value: Value, fallback: T) -> T {
    let mut final_item = self.decode_server_value(identity, server_value).unwrap_or(fallback);
    final_item.normalize();

    let mut items = self.inner.items.lock().unwrap();
    if let Some(index) = Self::position(&items, identity) {
      items[index] = Tracked {
        item: final_item.clone(),
        optimistic: false,
      };
    }
    self.write_through(&items);

    final_item
  }

  /// Clear the optimistic flag at `identity`, adopting the server's value
  /// when it sent one back.
  fn reconcile_existing(&self, identity: &str, server_value: Value) {
    let server_item = self.decode_server_value(identity, server_value);

    let mut items = self.inner.items.lock().unwrap();
    if let Some(index) = Self::position(&items, identity) {
      match server_item {
        Some(mut item) => {
          item.normalize();
          items[index] = Tracked {
            item,
            optimistic: false,
          };
        }
        None => items[index].optimistic = false,
      }
    }
    self.write_through(&items);
  }

  fn decode_server_value(&self, identity: &str, server_value: Value) -> Option<T> {
    if !server_value.is_object() {
      return None;
    }
    match serde_json::from_value(server_value) {
      Ok(item) => Some(item),
      Err(e) => {
        debug!(
          "Server value for {} does not decode, keeping local: {}",
          identity, e
        );
        None
      }
    }
  }

  fn write_through(&self, items: &[Tracked<T>]) {
    let plain: Vec<T> = items.iter().map(|tracked| tracked.item.clone()).collect();
    self.inner.cache.set(&self.inner.key, plain);
  }

  fn position(items: &[Tracked<T>], identity: &str) -> Option<usize> {
    items
      .iter()
      .position(|tracked| tracked.item.identity() == identity)
  }
}

impl<T: Entity, S: CacheStorage> Clone for Collection<T, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Entity, S: CacheStorage + 'static> UndoTarget for Collection<T, S> {
  fn replay_inverse(&self, action: UndoAction) -> BoxFuture<'static, Result<(), SyncError>> {
    let collection = self.clone();
    Box::pin(async move {
      match action {
        UndoAction::Add { identity } => collection.remove_internal(&identity, false).await,
        UndoAction::Remove { snapshot } => {
          let item: T = serde_json::from_value(snapshot)
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
          collection.add_internal(item, false).await.map(|_| ())
        }
        UndoAction::Update { identity, prior } => collection
          .update_internal(&identity, prior, false)
          .await
          .map(|_| ()),
        UndoAction::BulkUpdate { priors } => {
          for (identity, prior) in priors {
            collection.update_internal(&identity, prior, false).await?;
          }
          Ok(())
        }
      }
    })
  }
}
