//! Tiered cache store orchestrating the memory and persisted tiers.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Freshness};
use super::storage::{CacheStorage, PersistedEntry};
use crate::config::{AdaptiveConfig, SyncConfig};
use crate::perf::{MetricRecorder, OP_BACKGROUND_SYNC, OP_CACHE_HIT, OP_CACHE_MISS};

/// zstd level for persisted payloads. 0 selects the library default.
const COMPRESSION_LEVEL: i32 = 0;

/// A cached value together with its fetch timestamp.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
  pub value: T,
  pub fetched_at: DateTime<Utc>,
}

/// Result of a cache lookup with its derived freshness state.
#[derive(Debug, Clone)]
pub enum Lookup<T> {
  /// Serve immediately, no fetch needed
  Fresh(CachedValue<T>),
  /// Serve immediately, revalidate in the background
  Stale(CachedValue<T>),
  /// Must fetch before serving; the last-known value is still available
  /// as an offline fallback
  Expired(CachedValue<T>),
  Absent,
}

impl<T> Lookup<T> {
  pub fn value(&self) -> Option<&T> {
    match self {
      Lookup::Fresh(cached) | Lookup::Stale(cached) | Lookup::Expired(cached) => {
        Some(&cached.value)
      }
      Lookup::Absent => None,
    }
  }

  pub fn is_fresh(&self) -> bool {
    matches!(self, Lookup::Fresh(_))
  }

  pub fn is_absent(&self) -> bool {
    matches!(self, Lookup::Absent)
  }
}

/// Where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the backing source
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale but served while revalidation runs
  CacheStale,
  /// Source unreachable, serving the last-known value
  Offline,
}

/// Data returned by [`TieredCache::get_or_fetch`] with source metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
  pub data: T,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheRead<T> {
  fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  fn from_cache(cached: CachedValue<T>, source: CacheSource) -> Self {
    Self {
      data: cached.value,
      source,
      cached_at: Some(cached.fetched_at),
    }
  }
}

/// Memory-tier counts by freshness state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub memory_items: usize,
  pub fresh: usize,
  pub stale: usize,
  pub expired: usize,
}

struct CacheState<T> {
  memory: HashMap<String, CacheEntry<T>>,
}

struct Inner<T, S> {
  namespace: String,
  state: Mutex<CacheState<T>>,
  storage: Arc<S>,
  config: Arc<AdaptiveConfig>,
  recorder: Arc<MetricRecorder>,
  /// Keys with a background revalidation already in progress
  revalidating: Mutex<HashSet<String>>,
}

/// Tiered key-value cache: memory tier in front of a persisted tier.
///
/// One instance serves one resource kind; the value type is fixed per
/// instance. TTL bounds come from the injected [`AdaptiveConfig`] and are
/// stamped at write time, so re-tuning never rewrites history. Persisted
/// tier failures degrade to memory-only operation and are never surfaced
/// to callers.
pub struct TieredCache<T, S: CacheStorage> {
  inner: Arc<Inner<T, S>>,
}

impl<T, S> TieredCache<T, S>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
  S: CacheStorage + 'static,
{
  /// Create a cache for one resource kind (e.g. "participants").
  ///
  /// The persisted namespace is the config's storage prefix joined with
  /// the kind, so environments never read each other's rows.
  pub fn new(
    kind: &str,
    storage: S,
    config: Arc<AdaptiveConfig>,
    recorder: Arc<MetricRecorder>,
  ) -> Self {
    let prefix = config.effective().cache.storage_key_prefix.clone();
    Self {
      inner: Arc::new(Inner {
        namespace: format!("{prefix}:{kind}"),
        state: Mutex::new(CacheState {
          memory: HashMap::new(),
        }),
        storage: Arc::new(storage),
        config,
        recorder,
        revalidating: Mutex::new(HashSet::new()),
      }),
    }
  }

  /// Look up a key and classify its freshness.
  ///
  /// Checks the memory tier first, then promotes from the persisted tier.
  /// Corrupted persisted rows count as a miss and are purged. Fresh and
  /// stale lookups are recorded as cache hits, expired and absent as
  /// misses.
  pub fn get(&self, key: &str) -> Lookup<T> {
    let started = Instant::now();
    let now = Utc::now();
    let config = self.inner.config.effective();

    let lookup = self.lookup(key, now, &config);

    if config.cache.enable_metrics {
      let elapsed = started.elapsed().as_secs_f64() * 1000.0;
      let op = match &lookup {
        Lookup::Fresh(_) | Lookup::Stale(_) => OP_CACHE_HIT,
        Lookup::Expired(_) | Lookup::Absent => OP_CACHE_MISS,
      };
      self.inner.recorder.record_sample(op, elapsed, true);
    }

    lookup
  }

  /// Create or overwrite an entry, stamping TTL bounds from the current
  /// effective config. Triggers eviction when the memory tier exceeds its
  /// capacity.
  pub fn set(&self, key: &str, value: T) {
    let now = Utc::now();
    let config = self.inner.config.effective();
    let entry = CacheEntry::new(value, now, config.fresh_ttl(), config.stale_ttl());

    self.persist(key, &entry, &config);

    let mut state = self.inner.state.lock().unwrap();
    state.memory.insert(key.to_string(), entry);
    Self::enforce_capacity(&mut state.memory, config.cache.max_memory_items, now);
  }

  /// Read through the cache with the stale-while-revalidate strategy.
  ///
  /// 1. Fresh: return immediately, the fetcher is never called
  /// 2. Stale: return immediately and revalidate in the background
  /// 3. Expired: fetch; when the source is unreachable, serve the
  ///    last-known value marked [`CacheSource::Offline`]
  /// 4. Absent: fetch; a fetch failure propagates
  pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheRead<T>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let config = self.inner.config.effective();
    let timeout = std::time::Duration::from_millis(config.sync.request_timeout_ms);

    match self.get(key) {
      Lookup::Fresh(cached) => Ok(CacheRead::from_cache(cached, CacheSource::CacheFresh)),
      Lookup::Stale(cached) => {
        if config.sync.enable_background_sync {
          self.spawn_revalidation(key, fetcher);
        }
        Ok(CacheRead::from_cache(cached, CacheSource::CacheStale))
      }
      Lookup::Expired(cached) => match Self::fetch_with_timeout(fetcher, timeout).await {
        Ok(data) => {
          self.set(key, data.clone());
          Ok(CacheRead::from_network(data))
        }
        Err(e) => {
          debug!("Fetch failed for {}, serving last-known value: {}", key, e);
          Ok(CacheRead::from_cache(cached, CacheSource::Offline))
        }
      },
      Lookup::Absent => {
        let data = Self::fetch_with_timeout(fetcher, timeout).await?;
        self.set(key, data.clone());
        Ok(CacheRead::from_network(data))
      }
    }
  }

  /// Race a fetch against the configured timeout; an expiry is a fetch
  /// failure, never a hang.
  async fn fetch_with_timeout<F, Fut>(fetcher: F, timeout: std::time::Duration) -> Result<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    match tokio::time::timeout(timeout, fetcher()).await {
      Ok(result) => result,
      Err(_) => Err(color_eyre::eyre::eyre!(
        "fetch timed out after {}ms",
        timeout.as_millis()
      )),
    }
  }

  /// Drop an entry from both tiers.
  pub fn invalidate(&self, key: &str) {
    self.inner.state.lock().unwrap().memory.remove(key);
    if let Err(e) = self.inner.storage.remove(&self.inner.namespace, key) {
      warn!("Failed to remove persisted cache entry {}: {}", key, e);
    }
  }

  /// Drop every entry in this cache's namespace.
  pub fn clear(&self) {
    self.inner.state.lock().unwrap().memory.clear();
    if let Err(e) = self.inner.storage.clear(&self.inner.namespace) {
      warn!("Failed to clear persisted cache namespace: {}", e);
    }
  }

  /// Remove expired entries from the memory tier. Persisted rows are
  /// purged lazily when a read finds them expired or corrupted.
  pub fn purge_expired(&self) {
    let now = Utc::now();
    let mut state = self.inner.state.lock().unwrap();
    state
      .memory
      .retain(|_, entry| entry.state(now) != Freshness::Expired);
  }

  pub fn stats(&self) -> CacheStats {
    let now = Utc::now();
    let state = self.inner.state.lock().unwrap();

    let mut stats = CacheStats {
      memory_items: state.memory.len(),
      ..CacheStats::default()
    };
    for entry in state.memory.values() {
      match entry.state(now) {
        Freshness::Fresh => stats.fresh += 1,
        Freshness::Stale => stats.stale += 1,
        Freshness::Expired => stats.expired += 1,
      }
    }
    stats
  }

  fn lookup(&self, key: &str, now: DateTime<Utc>, config: &SyncConfig) -> Lookup<T> {
    {
      let mut state = self.inner.state.lock().unwrap();
      if let Some(entry) = state.memory.get_mut(key) {
        entry.touch(now);
        let cached = CachedValue {
          value: entry.value.clone(),
          fetched_at: entry.fetched_at,
        };
        return match entry.state(now) {
          Freshness::Fresh => Lookup::Fresh(cached),
          Freshness::Stale => Lookup::Stale(cached),
          Freshness::Expired => Lookup::Expired(cached),
        };
      }
    }

    match self.load_persisted(key, now) {
      Some(entry) => {
        let freshness = entry.state(now);
        let cached = CachedValue {
          value: entry.value.clone(),
          fetched_at: entry.fetched_at,
        };

        // Expired rows are not worth promoting; they only serve as the
        // offline fallback.
        if freshness != Freshness::Expired {
          let mut state = self.inner.state.lock().unwrap();
          state.memory.insert(key.to_string(), entry);
          Self::enforce_capacity(&mut state.memory, config.cache.max_memory_items, now);
        }

        match freshness {
          Freshness::Fresh => Lookup::Fresh(cached),
          Freshness::Stale => Lookup::Stale(cached),
          Freshness::Expired => Lookup::Expired(cached),
        }
      }
      None => Lookup::Absent,
    }
  }

  fn load_persisted(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
    let persisted = match self.inner.storage.get(&self.inner.namespace, key) {
      Ok(found) => found?,
      Err(e) => {
        warn!("Persisted cache read failed for {}: {}", key, e);
        return None;
      }
    };

    let bytes = if persisted.compressed {
      match zstd::decode_all(persisted.payload.as_slice()) {
        Ok(bytes) => bytes,
        Err(e) => {
          warn!("Corrupted compressed cache entry {}, dropping: {}", key, e);
          let _ = self.inner.storage.remove(&self.inner.namespace, key);
          return None;
        }
      }
    } else {
      persisted.payload
    };

    match serde_json::from_slice(&bytes) {
      Ok(value) => Some(CacheEntry {
        value,
        fetched_at: persisted.fetched_at,
        fresh_until: persisted.fresh_until,
        stale_until: persisted.stale_until,
        last_accessed: now,
      }),
      Err(e) => {
        warn!("Corrupted cache entry {}, dropping: {}", key, e);
        let _ = self.inner.storage.remove(&self.inner.namespace, key);
        None
      }
    }
  }

  fn persist(&self, key: &str, entry: &CacheEntry<T>, config: &SyncConfig) {
    let bytes = match serde_json::to_vec(&entry.value) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!("Failed to serialize cache entry {}: {}", key, e);
        return;
      }
    };

    let (payload, compressed) = if config.cache.enable_compression {
      match zstd::encode_all(bytes.as_slice(), COMPRESSION_LEVEL) {
        Ok(compressed) => (compressed, true),
        Err(e) => {
          warn!("Compression failed for {}, storing uncompressed: {}", key, e);
          (bytes, false)
        }
      }
    } else {
      (bytes, false)
    };

    let persisted = PersistedEntry {
      payload,
      compressed,
      fetched_at: entry.fetched_at,
      fresh_until: entry.fresh_until,
      stale_until: entry.stale_until,
    };

    if let Err(e) = self.inner.storage.put(&self.inner.namespace, key, &persisted) {
      warn!(
        "Persisted cache write failed for {}, continuing memory-only: {}",
        key, e
      );
    }
  }

  /// Evict until the memory tier fits its capacity.
  ///
  /// Victim order: expired entries (oldest fetched_at first), then stale,
  /// and only when still over capacity the oldest fresh entry.
  fn enforce_capacity(
    memory: &mut HashMap<String, CacheEntry<T>>,
    max_items: usize,
    now: DateTime<Utc>,
  ) {
    while memory.len() > max_items {
      let victim = Self::pick_victim(memory, now);
      match victim {
        Some(key) => {
          memory.remove(&key);
        }
        None => break,
      }
    }
  }

  fn pick_victim(memory: &HashMap<String, CacheEntry<T>>, now: DateTime<Utc>) -> Option<String> {
    let oldest_in = |wanted: Freshness| {
      memory
        .iter()
        .filter(|(_, entry)| entry.state(now) == wanted)
        .min_by_key(|(_, entry)| entry.fetched_at)
        .map(|(key, _)| key.clone())
    };

    oldest_in(Freshness::Expired)
      .or_else(|| oldest_in(Freshness::Stale))
      .or_else(|| oldest_in(Freshness::Fresh))
  }

  fn spawn_revalidation<F, Fut>(&self, key: &str, fetcher: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    {
      let mut revalidating = self.inner.revalidating.lock().unwrap();
      if !revalidating.insert(key.to_string()) {
        // A refresh for this key is already running
        return;
      }
    }

    let cache = self.clone();
    let key = key.to_string();
    let timeout = std::time::Duration::from_millis(
      self.inner.config.effective().sync.request_timeout_ms,
    );
    tokio::spawn(async move {
      let started = Instant::now();
      let result = Self::fetch_with_timeout(fetcher, timeout).await;
      let elapsed = started.elapsed().as_secs_f64() * 1000.0;

      let config = cache.inner.config.effective();
      match result {
        Ok(data) => {
          cache.set(&key, data);
          if config.cache.enable_metrics {
            cache
              .inner
              .recorder
              .record_sample(OP_BACKGROUND_SYNC, elapsed, true);
          }
        }
        Err(e) => {
          debug!("Background revalidation failed for {}: {}", key, e);
          if config.cache.enable_metrics {
            cache
              .inner
              .recorder
              .record_sample(OP_BACKGROUND_SYNC, elapsed, false);
          }
        }
      }

      cache.inner.revalidating.lock().unwrap().remove(&key);
    });
  }
}

impl<T, S: CacheStorage> Clone for TieredCache<T, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::NoopStorage;
  use crate::cache::SqliteStorage;
  use crate::perf::PerformanceOptimizer;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn test_config(fresh_ms: u64, stale_ms: u64, max_items: usize) -> Arc<AdaptiveConfig> {
    let mut base = SyncConfig::development();
    base.cache.fresh_ttl_ms = fresh_ms;
    base.cache.stale_ttl_ms = stale_ms;
    base.cache.max_memory_items = max_items;
    let recorder = Arc::new(MetricRecorder::new());
    Arc::new(AdaptiveConfig::new(
      base,
      Arc::new(PerformanceOptimizer::new(recorder)),
    ))
  }

  fn memory_cache(config: Arc<AdaptiveConfig>) -> TieredCache<String, NoopStorage> {
    TieredCache::new(
      "test",
      NoopStorage,
      config,
      Arc::new(MetricRecorder::new()),
    )
  }

  /// Storage double whose every operation fails.
  struct FailingStorage;

  impl CacheStorage for FailingStorage {
    fn put(&self, _: &str, _: &str, _: &PersistedEntry) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn get(&self, _: &str, _: &str) -> Result<Option<PersistedEntry>> {
      Err(eyre!("disk unreadable"))
    }
    fn remove(&self, _: &str, _: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
    fn clear(&self, _: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
  }

  #[tokio::test]
  async fn test_set_is_immediately_fresh() {
    let cache = memory_cache(test_config(60_000, 120_000, 50));
    cache.set("k", "value".to_string());

    assert!(cache.get("k").is_fresh());
  }

  #[tokio::test]
  async fn test_states_follow_ttls() {
    let cache = memory_cache(test_config(10, 40, 50));
    cache.set("k", "value".to_string());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(cache.get("k"), Lookup::Stale(_)));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(matches!(cache.get("k"), Lookup::Expired(_)));
  }

  #[tokio::test]
  async fn test_config_change_not_retroactive() {
    let config = test_config(60_000, 120_000, 50);
    let cache = memory_cache(config.clone());
    cache.set("k", "value".to_string());

    // Shrinking TTLs only affects entries written afterwards
    config
      .update(|c| {
        c.cache.fresh_ttl_ms = 1;
        c.cache.stale_ttl_ms = 2;
      })
      .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(cache.get("k").is_fresh());
  }

  #[tokio::test]
  async fn test_eviction_prefers_expired_then_stale_then_fresh() {
    let config = test_config(5, 10, 3);
    let cache = memory_cache(config.clone());

    cache.set("expired", "a".to_string());
    tokio::time::sleep(Duration::from_millis(25)).await;

    config
      .update(|c| {
        c.cache.fresh_ttl_ms = 5;
        c.cache.stale_ttl_ms = 60_000;
      })
      .unwrap();
    cache.set("stale", "b".to_string());
    tokio::time::sleep(Duration::from_millis(15)).await;

    config
      .update(|c| {
        c.cache.fresh_ttl_ms = 60_000;
        c.cache.stale_ttl_ms = 120_000;
      })
      .unwrap();
    cache.set("fresh-1", "c".to_string());

    // Capacity 3 exceeded: the expired entry goes first
    cache.set("fresh-2", "d".to_string());
    assert!(cache.get("expired").is_absent());
    assert!(!cache.get("stale").is_absent());

    // Next: the stale entry
    cache.set("fresh-3", "e".to_string());
    assert!(cache.get("stale").is_absent());
    assert!(!cache.get("fresh-1").is_absent());

    // Only fresh entries left: the oldest one is evicted
    cache.set("fresh-4", "f".to_string());
    assert!(cache.get("fresh-1").is_absent());
    assert!(!cache.get("fresh-2").is_absent());
    assert!(cache.stats().memory_items <= 3);
  }

  #[tokio::test]
  async fn test_capacity_never_exceeded() {
    let cache = memory_cache(test_config(60_000, 120_000, 5));
    for i in 0..20 {
      cache.set(&format!("k{i}"), "v".to_string());
      assert!(cache.stats().memory_items <= 5);
    }
  }

  #[tokio::test]
  async fn test_persisted_tier_survives_new_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let config = test_config(60_000, 120_000, 50);

    let cache: TieredCache<String, SqliteStorage> = TieredCache::new(
      "trips",
      SqliteStorage::open_at(&path).unwrap(),
      config.clone(),
      Arc::new(MetricRecorder::new()),
    );
    cache.set("k", "persisted".to_string());

    let reopened: TieredCache<String, SqliteStorage> = TieredCache::new(
      "trips",
      SqliteStorage::open_at(&path).unwrap(),
      config,
      Arc::new(MetricRecorder::new()),
    );
    let lookup = reopened.get("k");
    assert_eq!(lookup.value(), Some(&"persisted".to_string()));
    assert!(lookup.is_fresh());
  }

  #[tokio::test]
  async fn test_compression_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let config = test_config(60_000, 120_000, 50);
    config
      .update(|c| c.cache.enable_compression = true)
      .unwrap();

    let value = "x".repeat(4096);
    let cache: TieredCache<String, SqliteStorage> = TieredCache::new(
      "docs",
      SqliteStorage::open_at(&path).unwrap(),
      config.clone(),
      Arc::new(MetricRecorder::new()),
    );
    cache.set("big", value.clone());

    let storage = SqliteStorage::open_at(&path).unwrap();
    let raw = storage.get("tripsync-dev:docs", "big").unwrap().unwrap();
    assert!(raw.compressed);
    assert!(raw.payload.len() < value.len());

    let reopened: TieredCache<String, SqliteStorage> = TieredCache::new(
      "docs",
      SqliteStorage::open_at(&path).unwrap(),
      config,
      Arc::new(MetricRecorder::new()),
    );
    assert_eq!(reopened.get("big").value(), Some(&value));
  }

  #[tokio::test]
  async fn test_corrupted_persisted_entry_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let storage = SqliteStorage::open_at(&path).unwrap();

    let now = Utc::now();
    storage
      .put(
        "tripsync-dev:trips",
        "bad",
        &PersistedEntry {
          payload: b"not valid json at all{{{".to_vec(),
          compressed: false,
          fetched_at: now,
          fresh_until: now + chrono::Duration::minutes(5),
          stale_until: now + chrono::Duration::minutes(10),
        },
      )
      .unwrap();

    let cache: TieredCache<String, SqliteStorage> = TieredCache::new(
      "trips",
      SqliteStorage::open_at(&path).unwrap(),
      test_config(60_000, 120_000, 50),
      Arc::new(MetricRecorder::new()),
    );
    assert!(cache.get("bad").is_absent());
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_memory_only() {
    let cache: TieredCache<String, FailingStorage> = TieredCache::new(
      "trips",
      FailingStorage,
      test_config(60_000, 120_000, 50),
      Arc::new(MetricRecorder::new()),
    );

    // Writes and reads go through despite the broken persisted tier
    cache.set("k", "value".to_string());
    assert_eq!(cache.get("k").value(), Some(&"value".to_string()));
    cache.invalidate("k");
    assert!(cache.get("k").is_absent());
  }

  #[tokio::test]
  async fn test_get_or_fetch_serves_fresh_without_fetching() {
    let cache = memory_cache(test_config(60_000, 120_000, 50));
    cache.set("k", "cached".to_string());

    let fetches = Arc::new(AtomicU32::new(0));
    let counter = fetches.clone();
    let read = cache
      .get_or_fetch("k", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok("network".to_string()) }
      })
      .await
      .unwrap();

    assert_eq!(read.data, "cached");
    assert_eq!(read.source, CacheSource::CacheFresh);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_stale_serves_and_revalidates_in_background() {
    let cache = memory_cache(test_config(5, 60_000, 50));
    cache.set("k", "old".to_string());
    tokio::time::sleep(Duration::from_millis(15)).await;

    let read = cache
      .get_or_fetch("k", || async { Ok("refreshed".to_string()) })
      .await
      .unwrap();
    assert_eq!(read.data, "old");
    assert_eq!(read.source, CacheSource::CacheStale);

    // The background revalidation lands shortly after
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get("k").value(), Some(&"refreshed".to_string()));
  }

  #[tokio::test]
  async fn test_expired_with_dead_source_serves_offline() {
    let cache = memory_cache(test_config(5, 10, 50));
    cache.set("k", "last-known".to_string());
    tokio::time::sleep(Duration::from_millis(25)).await;

    let read = cache
      .get_or_fetch("k", || async { Err(eyre!("network down")) })
      .await
      .unwrap();
    assert_eq!(read.data, "last-known");
    assert_eq!(read.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_absent_fetch_failure_propagates() {
    let cache = memory_cache(test_config(60_000, 120_000, 50));
    let result = cache
      .get_or_fetch("missing", || async {
        Err::<String, _>(eyre!("network down"))
      })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_hit_miss_metrics_recorded() {
    let recorder = Arc::new(MetricRecorder::new());
    let cache: TieredCache<String, NoopStorage> = TieredCache::new(
      "test",
      NoopStorage,
      test_config(60_000, 120_000, 50),
      recorder.clone(),
    );

    cache.get("missing");
    cache.set("k", "v".to_string());
    cache.get("k");

    let samples = recorder.snapshot();
    assert_eq!(samples[crate::perf::OP_CACHE_MISS].len(), 1);
    assert_eq!(samples[crate::perf::OP_CACHE_HIT].len(), 1);
  }
}
