//! Metric aggregation, target validation and parameter tuning.

use std::collections::HashMap;
use std::sync::Arc;

use sysinfo::{Pid, ProcessesToUpdate, System};

use super::recorder::MetricRecorder;
use super::{OP_BACKGROUND_SYNC, OP_CACHE_HIT, OP_CACHE_MISS, OP_SYNC};

/// Fixed performance targets the engine is validated against.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceTargets {
  pub dashboard_load_ms: f64,
  pub navigation_ms: f64,
  pub cache_hit_rate: f64,
  pub max_memory_bytes: u64,
  pub max_sync_latency_ms: f64,
  pub max_error_rate: f64,
}

pub const PERFORMANCE_TARGETS: PerformanceTargets = PerformanceTargets {
  dashboard_load_ms: 200.0,
  navigation_ms: 100.0,
  cache_hit_rate: 0.85,
  max_memory_bytes: 50 * 1024 * 1024,
  max_sync_latency_ms: 5000.0,
  max_error_rate: 0.01,
};

/// Per-operation aggregate statistics.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct OpStats {
  pub average: f64,
  pub median: f64,
  pub p95: f64,
  pub count: usize,
}

/// Aggregated metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsReport {
  pub cache_hit_rate: f64,
  pub average_load_time_ms: f64,
  pub memory_usage_bytes: u64,
  pub sync_latency_ms: f64,
  pub error_rate: f64,
  pub background_sync_count: usize,
  pub operations: HashMap<String, OpStats>,
  pub recommendations: Vec<String>,
}

/// Cache/sync parameters proposed by the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunedCacheConfig {
  pub fresh_ttl_ms: u64,
  pub stale_ttl_ms: u64,
  pub max_memory_items: usize,
  pub sync_interval_ms: u64,
}

/// One target check in a validation report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationCheck {
  pub passed: bool,
  pub actual: f64,
  pub target: f64,
}

/// Result of checking current metrics against the fixed targets.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationReport {
  pub passed: bool,
  pub checks: HashMap<String, ValidationCheck>,
}

/// Baseline tuning values, matching the production preset.
const DEFAULT_FRESH_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_STALE_TTL_MS: u64 = 15 * 60 * 1000;
const DEFAULT_MAX_MEMORY_ITEMS: usize = 100;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 30 * 1000;

/// Rough per-sample memory estimate when process introspection fails.
const FALLBACK_BYTES_PER_SAMPLE: u64 = 8 * 1024;

/// Aggregates recorder samples into metrics and tuning proposals.
///
/// Pure in-memory aggregation; the only side channel is an optional process
/// memory probe.
pub struct PerformanceOptimizer {
  recorder: Arc<MetricRecorder>,
}

impl PerformanceOptimizer {
  pub fn new(recorder: Arc<MetricRecorder>) -> Self {
    Self { recorder }
  }

  pub fn recorder(&self) -> &Arc<MetricRecorder> {
    &self.recorder
  }

  /// Aggregate all recorded samples into a metrics report.
  pub fn metrics(&self) -> MetricsReport {
    let samples = self.recorder.snapshot();
    let mut operations = HashMap::new();
    let mut recommendations = Vec::new();

    for (operation_id, measurements) in &samples {
      if measurements.is_empty() {
        continue;
      }

      let mut sorted: Vec<f64> = measurements.iter().map(|s| s.duration_ms).collect();
      sorted.sort_by(|a, b| a.total_cmp(b));

      let average = sorted.iter().sum::<f64>() / sorted.len() as f64;
      let median = sorted[sorted.len() / 2];
      let p95_index = (sorted.len() as f64 * 0.95).floor() as usize;
      let p95 = *sorted.get(p95_index).unwrap_or(&sorted[sorted.len() - 1]);

      if operation_id.contains("dashboard") && average > PERFORMANCE_TARGETS.dashboard_load_ms {
        recommendations.push(format!(
          "Dashboard loading is slow ({}ms). Consider pre-loading critical data.",
          average.round()
        ));
      }
      if operation_id.contains("navigation") && average > PERFORMANCE_TARGETS.navigation_ms {
        recommendations.push(format!(
          "Navigation is slow ({}ms). Check cache hit rates and memory usage.",
          average.round()
        ));
      }
      if p95 > average * 2.0 {
        recommendations.push(format!(
          "{} has high variance. Some requests are significantly slower than others.",
          operation_id
        ));
      }

      operations.insert(
        operation_id.clone(),
        OpStats {
          average,
          median,
          p95,
          count: sorted.len(),
        },
      );
    }

    let (error_count, total_count) = self.recorder.counters();
    let error_rate = if total_count > 0 {
      error_count as f64 / total_count as f64
    } else {
      0.0
    };

    let total_samples: usize = samples.values().map(Vec::len).sum();
    let memory_usage_bytes = estimate_memory_usage(total_samples);

    if memory_usage_bytes as f64 > PERFORMANCE_TARGETS.max_memory_bytes as f64 * 0.8 {
      recommendations.push(format!(
        "Memory usage is high ({}MB). Consider reducing cache TTL or max items.",
        memory_usage_bytes / 1024 / 1024
      ));
    }
    if error_rate > PERFORMANCE_TARGETS.max_error_rate {
      recommendations.push(format!(
        "Error rate is high ({}%). Check network connectivity and API health.",
        (error_rate * 100.0).round()
      ));
    }

    let hits = samples.get(OP_CACHE_HIT).map_or(0, Vec::len);
    let misses = samples.get(OP_CACHE_MISS).map_or(0, Vec::len);
    let cache_hit_rate = if hits + misses > 0 {
      hits as f64 / (hits + misses) as f64
    } else {
      0.0
    };

    let average_load_time_ms = operations
      .get("dashboard_load")
      .map_or(0.0, |stats| stats.average);
    let sync_latency_ms = operations.get(OP_SYNC).map_or(0.0, |stats| stats.average);
    let background_sync_count = operations
      .get(OP_BACKGROUND_SYNC)
      .map_or(0, |stats| stats.count);

    MetricsReport {
      cache_hit_rate,
      average_load_time_ms,
      memory_usage_bytes,
      sync_latency_ms,
      error_rate,
      background_sync_count,
      operations,
      recommendations,
    }
  }

  /// Propose cache/sync parameters from current metrics.
  pub fn optimized_cache_config(&self) -> TunedCacheConfig {
    let metrics = self.metrics();

    let mut fresh_ttl_ms = DEFAULT_FRESH_TTL_MS;
    let mut stale_ttl_ms = DEFAULT_STALE_TTL_MS;
    let mut max_memory_items = DEFAULT_MAX_MEMORY_ITEMS;
    let mut sync_interval_ms = DEFAULT_SYNC_INTERVAL_MS;

    // Low hit rate: entries expire before they are reused, extend TTLs.
    // Very high hit rate: room to serve fresher data.
    if metrics.cache_hit_rate < 0.5 {
      fresh_ttl_ms *= 2;
      stale_ttl_ms *= 2;
    } else if metrics.cache_hit_rate > 0.9 {
      fresh_ttl_ms = (fresh_ttl_ms as f64 * 0.8) as u64;
      stale_ttl_ms = (stale_ttl_ms as f64 * 0.8) as u64;
    }

    if metrics.memory_usage_bytes as f64 > PERFORMANCE_TARGETS.max_memory_bytes as f64 * 0.8 {
      max_memory_items = (max_memory_items as f64 * 0.7).floor() as usize;
    }

    if metrics.sync_latency_ms > 2000.0 {
      sync_interval_ms = ((sync_interval_ms as f64 * 1.5) as u64).min(60 * 1000);
    } else if metrics.sync_latency_ms > 0.0 && metrics.sync_latency_ms < 500.0 {
      sync_interval_ms = ((sync_interval_ms as f64 * 0.8) as u64).max(10 * 1000);
    }

    TunedCacheConfig {
      fresh_ttl_ms,
      stale_ttl_ms,
      max_memory_items,
      sync_interval_ms,
    }
  }

  /// Check current metrics against the fixed targets.
  pub fn validate_performance(&self) -> ValidationReport {
    let metrics = self.metrics();
    let navigation_ms = metrics
      .operations
      .get("navigation")
      .map_or(0.0, |stats| stats.average);

    let mut checks = HashMap::new();
    checks.insert(
      "dashboard_load".to_string(),
      ValidationCheck {
        passed: metrics.average_load_time_ms <= PERFORMANCE_TARGETS.dashboard_load_ms,
        actual: metrics.average_load_time_ms,
        target: PERFORMANCE_TARGETS.dashboard_load_ms,
      },
    );
    checks.insert(
      "navigation".to_string(),
      ValidationCheck {
        passed: navigation_ms <= PERFORMANCE_TARGETS.navigation_ms,
        actual: navigation_ms,
        target: PERFORMANCE_TARGETS.navigation_ms,
      },
    );
    checks.insert(
      "cache_hit_rate".to_string(),
      ValidationCheck {
        passed: metrics.cache_hit_rate >= PERFORMANCE_TARGETS.cache_hit_rate,
        actual: metrics.cache_hit_rate,
        target: PERFORMANCE_TARGETS.cache_hit_rate,
      },
    );
    checks.insert(
      "memory_usage_mb".to_string(),
      ValidationCheck {
        passed: metrics.memory_usage_bytes <= PERFORMANCE_TARGETS.max_memory_bytes,
        actual: metrics.memory_usage_bytes as f64 / 1024.0 / 1024.0,
        target: PERFORMANCE_TARGETS.max_memory_bytes as f64 / 1024.0 / 1024.0,
      },
    );
    checks.insert(
      "sync_latency".to_string(),
      ValidationCheck {
        passed: metrics.sync_latency_ms <= PERFORMANCE_TARGETS.max_sync_latency_ms,
        actual: metrics.sync_latency_ms,
        target: PERFORMANCE_TARGETS.max_sync_latency_ms,
      },
    );
    checks.insert(
      "error_rate_pct".to_string(),
      ValidationCheck {
        passed: metrics.error_rate <= PERFORMANCE_TARGETS.max_error_rate,
        actual: metrics.error_rate * 100.0,
        target: PERFORMANCE_TARGETS.max_error_rate * 100.0,
      },
    );

    let passed = checks.values().all(|check| check.passed);
    ValidationReport { passed, checks }
  }

  /// Clear all recorded samples and counters. Used for test isolation.
  pub fn reset(&self) {
    self.recorder.reset();
  }

  /// Dump current metrics and validation as JSON, for debugging and
  /// analytics export.
  pub fn export_metrics(&self) -> String {
    let export = serde_json::json!({
      "timestamp": chrono::Utc::now().to_rfc3339(),
      "metrics": self.metrics(),
      "validation": self.validate_performance(),
    });
    serde_json::to_string_pretty(&export).unwrap_or_else(|_| "{}".to_string())
  }
}

/// Estimate the cache's memory footprint.
///
/// Uses the process resident set when the platform exposes it (the cache's
/// share is taken as a tenth of the process total); otherwise falls back to
/// a rough per-sample constant.
fn estimate_memory_usage(total_samples: usize) -> u64 {
  let pid = Pid::from_u32(std::process::id());
  let mut system = System::new();
  system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

  match system.process(pid) {
    Some(process) if process.memory() > 0 => process.memory() / 10,
    _ => total_samples as u64 * FALLBACK_BYTES_PER_SAMPLE,
  }
}
