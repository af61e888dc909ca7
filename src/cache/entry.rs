//! Cache entry with fresh/stale TTL bands.

use chrono::{DateTime, Duration, Utc};

/// Derived freshness state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Inside the fresh window: serve without revalidation
  Fresh,
  /// Past fresh but inside the stale window: serve and revalidate
  Stale,
  /// Past the stale window: must refetch before serving
  Expired,
}

/// A single cached value with its TTL bounds.
///
/// Bounds are stamped from the effective config at write time; a later
/// config change never alters entries already stored.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub fetched_at: DateTime<Utc>,
  pub fresh_until: DateTime<Utc>,
  pub stale_until: DateTime<Utc>,
  pub last_accessed: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// Create an entry stamped `now`, enforcing `fresh_until <= stale_until`
  /// by clamping the fresh bound when the TTLs are inverted.
  pub fn new(value: T, now: DateTime<Utc>, fresh_ttl: Duration, stale_ttl: Duration) -> Self {
    let stale_until = now + stale_ttl;
    let fresh_until = (now + fresh_ttl).min(stale_until);

    Self {
      value,
      fetched_at: now,
      fresh_until,
      stale_until,
      last_accessed: now,
    }
  }

  pub fn state(&self, now: DateTime<Utc>) -> Freshness {
    if now < self.fresh_until {
      Freshness::Fresh
    } else if now < self.stale_until {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }

  pub fn touch(&mut self, now: DateTime<Utc>) {
    self.last_accessed = now;
  }
}
