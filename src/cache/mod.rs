//! Tiered caching layer: memory tier plus persisted tier with TTL bands.
//!
//! Every entry carries two TTL bounds stamped at write time. Reads classify
//! the entry as fresh (serve as-is), stale (serve and revalidate in the
//! background) or expired (refetch, falling back to the last-known value
//! when the source is unreachable). The persisted tier survives restarts
//! and degrades silently: a storage failure never reaches the caller.

mod entry;
mod storage;
mod store;

pub use entry::{CacheEntry, Freshness};
pub use storage::{CacheStorage, NoopStorage, PersistedEntry, SqliteStorage};
pub use store::{CacheRead, CacheSource, CacheStats, CachedValue, Lookup, TieredCache};
