//! Performance measurement and self-tuning.
//!
//! The recorder collects per-operation timing samples; the optimizer
//! aggregates them into metrics, recommendations and tuned cache/sync
//! parameters consumed by the adaptive configuration.

mod optimizer;
mod recorder;

pub use optimizer::{
  MetricsReport, OpStats, PerformanceOptimizer, PerformanceTargets, TunedCacheConfig,
  ValidationCheck, ValidationReport, PERFORMANCE_TARGETS,
};
pub use recorder::MetricRecorder;

/// Operation id for cache lookups that were served from cache.
pub const OP_CACHE_HIT: &str = "cache_hit";
/// Operation id for cache lookups that missed.
pub const OP_CACHE_MISS: &str = "cache_miss";
/// Operation id for sync queue dispatch attempts.
pub const OP_SYNC: &str = "sync_operation";
/// Operation id for background revalidation fetches.
pub const OP_BACKGROUND_SYNC: &str = "background_sync";
