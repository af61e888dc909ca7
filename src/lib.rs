//! tripsync: client-side smart caching and synchronization engine.
//!
//! Offline-capable CRUD apps need three things from their data layer:
//! instant reads, instant writes, and honesty about both. This crate
//! provides them as a reusable core:
//!
//! - [`cache::TieredCache`]: memory + persisted tiers with fresh/stale TTL
//!   bands, stale-while-revalidate reads and offline fallback
//! - [`sync::SyncQueue`]: ordered background dispatch of mutations with
//!   retry, backoff and pluggable conflict resolution
//! - [`optimistic::Collection`]: apply-now/reconcile-later mutations with
//!   rollback and a shared undo stack
//! - [`perf`] and [`config`]: metric recording, target validation and a
//!   configuration that re-tunes itself from observed performance
//!
//! The engine is resource-agnostic: it only consumes a [`source::DataSource`]
//! implementation supplied by the application glue.

pub mod cache;
pub mod config;
pub mod entity;
pub mod optimistic;
pub mod perf;
pub mod source;
pub mod sync;

pub use cache::{CacheRead, CacheSource, SqliteStorage, TieredCache};
pub use config::{AdaptiveConfig, Environment, SyncConfig};
pub use entity::Entity;
pub use optimistic::{Collection, DebouncedUpdater, UndoManager};
pub use perf::{MetricRecorder, PerformanceOptimizer};
pub use source::{DataSource, MutateOutcome, Operation, SourceError};
pub use sync::{ConflictStrategy, SyncError, SyncQueue, SyncResult};
