//! Core trait for entities managed by the optimistic collection layer.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Trait for entities that can be cached and synchronized.
///
/// Implementors provide a unique identity key (used for per-key sync
/// ordering and duplicate detection) and may override `normalize` to
/// enforce invariants on their own fields after a mutation.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g. participant id, activity id)
  fn identity(&self) -> String;

  /// Entity type name for storage organization and sync keys
  /// (e.g. "participant", "activity")
  fn entity_type() -> &'static str;

  /// Repair invalid field combinations in place.
  ///
  /// Called after every patch application, before the result is cached or
  /// dispatched. The default does nothing; entities with a date range clamp
  /// an inverted range here so `end >= start` always holds.
  fn normalize(&mut self) {}
}

/// Apply a JSON field patch to an entity.
///
/// The entity is round-tripped through its JSON representation, the patch
/// object's fields are overlaid, and the result is deserialized back and
/// normalized. Fails if the patch is not a JSON object or the merged value
/// no longer deserializes into `T`.
pub fn apply_patch<T: Entity>(entity: &T, patch: &Value) -> Result<T> {
  let fields = patch
    .as_object()
    .ok_or_else(|| eyre!("Patch must be a JSON object, got: {}", patch))?;

  let mut merged = serde_json::to_value(entity)
    .map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

  match merged.as_object_mut() {
    Some(obj) => {
      for (key, value) in fields {
        obj.insert(key.clone(), value.clone());
      }
    }
    None => return Err(eyre!("Entity did not serialize to a JSON object")),
  }

  let mut patched: T = serde_json::from_value(merged)
    .map_err(|e| eyre!("Patched entity no longer deserializes: {}", e))?;
  patched.normalize();

  Ok(patched)
}

/// Extract the patch's own keys back out of a normalized entity.
///
/// Used by the debounced updater: after `apply_patch` + `normalize`, the
/// payload actually dispatched must reflect the normalized values, not the
/// raw caller input.
pub fn extract_fields<T: Entity>(entity: &T, patch: &Value) -> Result<Value> {
  let keys = patch
    .as_object()
    .ok_or_else(|| eyre!("Patch must be a JSON object, got: {}", patch))?;

  let serialized = serde_json::to_value(entity)
    .map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
  let obj = serialized
    .as_object()
    .ok_or_else(|| eyre!("Entity did not serialize to a JSON object"))?;

  let mut out = serde_json::Map::new();
  for key in keys.keys() {
    if let Some(value) = obj.get(key) {
      out.insert(key.clone(), value.clone());
    }
  }

  Ok(Value::Object(out))
}
