//! Environment-aware configuration for the caching and sync system.
//!
//! A base preset is selected from the environment (or loaded from a YAML
//! file) once at startup; [`AdaptiveConfig`] then layers optimizer-tuned
//! values on top without ever violating the config invariants.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::perf::{PerformanceOptimizer, ValidationReport};
use crate::sync::ConflictStrategy;

/// Cache tier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Time until an entry is considered stale (served, but revalidated)
  pub fresh_ttl_ms: u64,
  /// Time until an entry is considered expired (must refetch)
  pub stale_ttl_ms: u64,
  /// Maximum entries kept in the memory tier
  pub max_memory_items: usize,
  /// Namespace prefix for the persisted tier
  pub storage_key_prefix: String,
  /// Compress persisted payloads (memory tier is never compressed)
  pub enable_compression: bool,
  /// Record cache_hit/cache_miss samples on every lookup
  pub enable_metrics: bool,
}

/// Sync queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Worker wake interval when no enqueue nudges it sooner
  pub sync_interval_ms: u64,
  /// Retries after the initial dispatch attempt
  pub retry_attempts: u32,
  /// Maximum tasks dispatched concurrently per cycle (distinct keys)
  pub batch_size: usize,
  pub conflict_strategy: ConflictStrategy,
  pub enable_background_sync: bool,
  /// Enqueue is rejected beyond this many queued tasks
  pub max_queue_size: usize,
  /// Every dispatch is raced against this timeout
  pub request_timeout_ms: u64,
}

/// Target metrics the optimizer validates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetMetrics {
  pub dashboard_load_ms: f64,
  pub navigation_ms: f64,
  pub cache_hit_rate: f64,
  pub max_memory_bytes: u64,
}

/// Performance monitoring and tuning switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
  pub enable_optimization: bool,
  pub enable_monitoring: bool,
  pub target_metrics: TargetMetrics,
  /// Allow [`AdaptiveConfig`] to merge optimizer-tuned values
  pub auto_tuning: bool,
}

/// Development and test hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentSettings {
  pub enable_debug_mode: bool,
  pub enable_verbose_logging: bool,
  /// Inject artificial latency before every dispatch
  pub simulate_slow_network: bool,
  /// Treat every sync cycle as offline (tasks stay pending)
  pub simulate_offline_mode: bool,
}

/// Full configuration for the caching and sync system.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub cache: CacheSettings,
  pub sync: SyncSettings,
  pub performance: PerformanceSettings,
  pub development: DevelopmentSettings,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      fresh_ttl_ms: 2 * 60 * 1000,
      stale_ttl_ms: 5 * 60 * 1000,
      max_memory_items: 50,
      storage_key_prefix: "tripsync-dev".to_string(),
      enable_compression: false,
      enable_metrics: true,
    }
  }
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      sync_interval_ms: 10 * 1000,
      retry_attempts: 2,
      batch_size: 5,
      conflict_strategy: ConflictStrategy::Merge,
      enable_background_sync: true,
      max_queue_size: 100,
      request_timeout_ms: 30 * 1000,
    }
  }
}

impl Default for TargetMetrics {
  fn default() -> Self {
    Self {
      dashboard_load_ms: 500.0,
      navigation_ms: 200.0,
      cache_hit_rate: 0.7,
      max_memory_bytes: 100 * 1024 * 1024,
    }
  }
}

impl Default for PerformanceSettings {
  fn default() -> Self {
    Self {
      enable_optimization: false,
      enable_monitoring: true,
      target_metrics: TargetMetrics::default(),
      auto_tuning: false,
    }
  }
}

impl Default for DevelopmentSettings {
  fn default() -> Self {
    Self {
      enable_debug_mode: true,
      enable_verbose_logging: true,
      simulate_slow_network: false,
      simulate_offline_mode: false,
    }
  }
}

/// Deployment environment, selected by `TRIPSYNC_ENV` (or `APP_ENV`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
  Development,
  Staging,
  Production,
}

impl Environment {
  /// Parse an environment name, falling back to development with a warning.
  pub fn parse(name: &str) -> Self {
    match name {
      "development" => Environment::Development,
      "staging" => Environment::Staging,
      "production" => Environment::Production,
      other => {
        warn!("Unknown environment '{}', using development config", other);
        Environment::Development
      }
    }
  }

  pub fn from_env() -> Self {
    let name = std::env::var("TRIPSYNC_ENV")
      .or_else(|_| std::env::var("APP_ENV"))
      .unwrap_or_else(|_| "development".to_string());
    Self::parse(&name)
  }
}

impl SyncConfig {
  /// Development preset: short TTLs, frequent sync, no tuning.
  pub fn development() -> Self {
    Self::default()
  }

  /// Production preset: longer TTLs, compression, auto-tuning enabled.
  pub fn production() -> Self {
    Self {
      cache: CacheSettings {
        fresh_ttl_ms: 5 * 60 * 1000,
        stale_ttl_ms: 15 * 60 * 1000,
        max_memory_items: 100,
        storage_key_prefix: "tripsync".to_string(),
        enable_compression: true,
        enable_metrics: true,
      },
      sync: SyncSettings {
        sync_interval_ms: 30 * 1000,
        retry_attempts: 3,
        batch_size: 10,
        conflict_strategy: ConflictStrategy::Merge,
        enable_background_sync: true,
        max_queue_size: 1000,
        request_timeout_ms: 30 * 1000,
      },
      performance: PerformanceSettings {
        enable_optimization: true,
        enable_monitoring: true,
        target_metrics: TargetMetrics {
          dashboard_load_ms: 200.0,
          navigation_ms: 100.0,
          cache_hit_rate: 0.85,
          max_memory_bytes: 50 * 1024 * 1024,
        },
        auto_tuning: true,
      },
      development: DevelopmentSettings {
        enable_debug_mode: false,
        enable_verbose_logging: false,
        simulate_slow_network: false,
        simulate_offline_mode: false,
      },
    }
  }

  /// Staging preset: production values with debugging enabled.
  pub fn staging() -> Self {
    let mut config = Self::production();
    config.cache.storage_key_prefix = "tripsync-staging".to_string();
    config.development.enable_debug_mode = true;
    config.development.enable_verbose_logging = true;
    config
  }

  pub fn for_environment(env: Environment) -> Self {
    match env {
      Environment::Development => Self::development(),
      Environment::Staging => Self::staging(),
      Environment::Production => Self::production(),
    }
  }

  /// Select the preset for the current process environment.
  pub fn from_env() -> Self {
    Self::for_environment(Environment::from_env())
  }

  /// Load configuration from a YAML file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (error if missing)
  /// 2. ./tripsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tripsync/config.yaml
  /// 4. Environment preset when no file is found
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::from_env()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tripsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tripsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: SyncConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn fresh_ttl(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.cache.fresh_ttl_ms as i64)
  }

  pub fn stale_ttl(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.cache.stale_ttl_ms as i64)
  }
}

/// Outcome of validating a configuration. Errors block activation;
/// warnings are reported but tolerated.
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
}

impl ConfigReport {
  pub fn is_valid(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Check a configuration against the system invariants.
pub fn validate_config(config: &SyncConfig) -> ConfigReport {
  let mut report = ConfigReport::default();

  if config.cache.fresh_ttl_ms >= config.cache.stale_ttl_ms {
    report
      .errors
      .push("cache.fresh_ttl_ms must be less than cache.stale_ttl_ms".to_string());
  }

  if config.cache.fresh_ttl_ms < 1000 {
    report
      .warnings
      .push("fresh_ttl is very short (<1s), may cause excessive API calls".to_string());
  }
  if config.cache.stale_ttl_ms > 60 * 60 * 1000 {
    report
      .warnings
      .push("stale_ttl is very long (>1h), data may become very stale".to_string());
  }
  if config.cache.max_memory_items < 10 {
    report
      .warnings
      .push("max_memory_items is very low (<10), may hurt performance".to_string());
  }
  if config.cache.max_memory_items > 1000 {
    report
      .warnings
      .push("max_memory_items is very high (>1000), may use excessive memory".to_string());
  }
  if config.sync.sync_interval_ms < 5000 {
    report
      .warnings
      .push("sync_interval is very frequent (<5s), may cause server load".to_string());
  }
  if config.sync.batch_size > 50 {
    report
      .warnings
      .push("batch_size is very large (>50), may cause long request times".to_string());
  }

  let targets = &config.performance.target_metrics;
  if targets.dashboard_load_ms < 50.0 {
    report
      .warnings
      .push("dashboard_load target is very aggressive (<50ms)".to_string());
  }
  if targets.cache_hit_rate > 0.98 {
    report
      .warnings
      .push("cache_hit_rate target is very high (>98%), may be unrealistic".to_string());
  }

  report
}

/// Re-optimization throttle for [`AdaptiveConfig::effective`].
const OPTIMIZATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration that adapts to observed performance.
///
/// Wraps a base config; when auto-tuning is enabled, periodically merges
/// the optimizer's proposed {fresh_ttl, stale_ttl, max_memory_items,
/// sync_interval} into a copy of the base. A proposal that fails
/// validation is discarded and the base stays active.
pub struct AdaptiveConfig {
  base: Mutex<SyncConfig>,
  optimizer: Arc<PerformanceOptimizer>,
  tuned: Mutex<Option<SyncConfig>>,
  last_optimization: Mutex<Option<Instant>>,
  optimization_interval: Duration,
}

impl AdaptiveConfig {
  pub fn new(base: SyncConfig, optimizer: Arc<PerformanceOptimizer>) -> Self {
    Self {
      base: Mutex::new(base),
      optimizer,
      tuned: Mutex::new(None),
      last_optimization: Mutex::new(None),
      optimization_interval: OPTIMIZATION_INTERVAL,
    }
  }

  /// Override the re-optimization throttle. Mostly useful in tests.
  pub fn with_optimization_interval(mut self, interval: Duration) -> Self {
    self.optimization_interval = interval;
    self
  }

  /// Current effective configuration.
  ///
  /// Returns the base unchanged when auto-tuning is off. Otherwise the
  /// last tuned copy, recomputed at most once per throttle interval.
  pub fn effective(&self) -> SyncConfig {
    let base = self.base.lock().unwrap().clone();
    if !base.performance.auto_tuning {
      return base;
    }

    {
      let last = self.last_optimization.lock().unwrap();
      if let Some(at) = *last {
        if at.elapsed() < self.optimization_interval {
          return self.tuned.lock().unwrap().clone().unwrap_or(base);
        }
      }
    }

    let proposal = self.optimizer.optimized_cache_config();
    let mut merged = base.clone();
    merged.cache.fresh_ttl_ms = proposal.fresh_ttl_ms;
    merged.cache.stale_ttl_ms = proposal.stale_ttl_ms;
    merged.cache.max_memory_items = proposal.max_memory_items;
    merged.sync.sync_interval_ms = proposal.sync_interval_ms;

    *self.last_optimization.lock().unwrap() = Some(Instant::now());

    let report = validate_config(&merged);
    if !report.is_valid() {
      warn!(
        "Rejecting tuned config proposal: {}",
        report.errors.join("; ")
      );
      *self.tuned.lock().unwrap() = None;
      return base;
    }

    *self.tuned.lock().unwrap() = Some(merged.clone());
    merged
  }

  /// Mutate the base configuration, rejecting the change when the result
  /// fails validation.
  pub fn update<F: FnOnce(&mut SyncConfig)>(&self, mutate: F) -> Result<()> {
    let mut base = self.base.lock().unwrap();
    let mut candidate = base.clone();
    mutate(&mut candidate);

    let report = validate_config(&candidate);
    if !report.is_valid() {
      return Err(eyre!(
        "Invalid configuration update: {}",
        report.errors.join("; ")
      ));
    }
    for warning in &report.warnings {
      warn!("Config warning: {}", warning);
    }

    *base = candidate;
    *self.tuned.lock().unwrap() = None;
    *self.last_optimization.lock().unwrap() = None;
    Ok(())
  }

  /// Reset to the given base and forget any tuned state.
  pub fn reset(&self, base: SyncConfig) {
    *self.base.lock().unwrap() = base;
    *self.tuned.lock().unwrap() = None;
    *self.last_optimization.lock().unwrap() = None;
  }

  /// Check current metrics against the performance targets, together with
  /// the optimizer's recommendations.
  pub fn validate_performance(&self) -> (ValidationReport, Vec<String>) {
    let report = self.optimizer.validate_performance();
    let recommendations = self.optimizer.metrics().recommendations;
    (report, recommendations)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::perf::{MetricRecorder, OP_CACHE_HIT, OP_CACHE_MISS};
  use std::io::Write;

  fn optimizer() -> Arc<PerformanceOptimizer> {
    Arc::new(PerformanceOptimizer::new(Arc::new(MetricRecorder::new())))
  }

  #[test]
  fn test_inverted_ttls_rejected() {
    let mut config = SyncConfig::development();
    config.cache.fresh_ttl_ms = 10_000;
    config.cache.stale_ttl_ms = 5_000;

    let report = validate_config(&config);
    assert!(!report.is_valid());
    assert!(!report.errors.is_empty());
  }

  #[test]
  fn test_presets_are_valid() {
    for config in [
      SyncConfig::development(),
      SyncConfig::staging(),
      SyncConfig::production(),
    ] {
      let report = validate_config(&config);
      assert!(report.is_valid(), "preset failed: {:?}", report.errors);
    }
  }

  #[test]
  fn test_extreme_values_warn_but_pass() {
    let mut config = SyncConfig::production();
    config.cache.fresh_ttl_ms = 500;
    config.cache.stale_ttl_ms = 2 * 60 * 60 * 1000;
    config.cache.max_memory_items = 5;
    config.sync.batch_size = 100;

    let report = validate_config(&config);
    assert!(report.is_valid());
    assert!(report.warnings.len() >= 4);
  }

  #[test]
  fn test_unknown_environment_falls_back() {
    assert_eq!(Environment::parse("weird"), Environment::Development);
    assert_eq!(Environment::parse("production"), Environment::Production);
  }

  #[test]
  fn test_yaml_overrides_with_section_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "cache:\n  fresh_ttl_ms: 1000\n  stale_ttl_ms: 4000\nsync:\n  batch_size: 7\n"
    )
    .unwrap();

    let config = SyncConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.cache.fresh_ttl_ms, 1000);
    assert_eq!(config.cache.stale_ttl_ms, 4000);
    assert_eq!(config.sync.batch_size, 7);
    // Untouched sections keep their defaults
    assert!(config.development.enable_debug_mode);
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    assert!(SyncConfig::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }

  #[test]
  fn test_auto_tuning_off_returns_base() {
    let mut base = SyncConfig::development();
    base.performance.auto_tuning = false;
    let adaptive = AdaptiveConfig::new(base.clone(), optimizer());

    assert_eq!(adaptive.effective(), base);
  }

  #[test]
  fn test_auto_tuning_merges_only_tunable_fields() {
    let optimizer = optimizer();
    // Low hit rate: the tuner should extend TTLs
    for _ in 0..70 {
      optimizer.recorder().record_sample(OP_CACHE_MISS, 1.0, true);
    }
    for _ in 0..30 {
      optimizer.recorder().record_sample(OP_CACHE_HIT, 1.0, true);
    }

    let base = SyncConfig::production();
    let adaptive =
      AdaptiveConfig::new(base.clone(), optimizer).with_optimization_interval(Duration::ZERO);

    let effective = adaptive.effective();
    assert!(effective.cache.fresh_ttl_ms > base.cache.fresh_ttl_ms);
    assert!(effective.cache.stale_ttl_ms > base.cache.stale_ttl_ms);
    // Non-tunable fields untouched
    assert_eq!(effective.sync.retry_attempts, base.sync.retry_attempts);
    assert_eq!(
      effective.cache.enable_compression,
      base.cache.enable_compression
    );
  }

  #[test]
  fn test_throttle_returns_cached_tuning() {
    let optimizer = optimizer();
    let base = SyncConfig::production();
    let adaptive = AdaptiveConfig::new(base, optimizer.clone());

    let first = adaptive.effective();
    // New samples arrive, but the throttle window has not elapsed
    for _ in 0..100 {
      optimizer.recorder().record_sample(OP_CACHE_MISS, 1.0, true);
    }
    let second = adaptive.effective();
    assert_eq!(first, second);
  }

  #[test]
  fn test_update_rejects_invalid() {
    let base = SyncConfig::development();
    let adaptive = AdaptiveConfig::new(base.clone(), optimizer());

    let result = adaptive.update(|config| {
      config.cache.fresh_ttl_ms = config.cache.stale_ttl_ms + 1;
    });
    assert!(result.is_err());
    assert_eq!(adaptive.effective(), base);
  }

  #[test]
  fn test_update_applies_valid_change() {
    let adaptive = AdaptiveConfig::new(SyncConfig::development(), optimizer());

    adaptive
      .update(|config| config.sync.batch_size = 20)
      .unwrap();
    assert_eq!(adaptive.effective().sync.batch_size, 20);
  }
}
