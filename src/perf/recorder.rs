//! Timing sample recorder for named operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// Samples kept per operation id. Older samples are dropped.
const MAX_SAMPLES_PER_OP: usize = 100;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
  pub duration_ms: f64,
  pub success: bool,
}

#[derive(Default)]
struct RecorderState {
  samples: HashMap<String, VecDeque<Sample>>,
  start_times: HashMap<String, Instant>,
  error_count: u64,
  total_count: u64,
}

/// Records start/end timestamps and success outcomes for named operations.
///
/// Multiple concurrent operations with the same id are not distinguished:
/// the last `start_measurement` wins. Callers that time overlapping work
/// themselves should use [`MetricRecorder::record_sample`] instead, which
/// is what the sync queue does for batched dispatches.
#[derive(Default)]
pub struct MetricRecorder {
  state: Mutex<RecorderState>,
}

impl MetricRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a start timestamp for the operation.
  pub fn start_measurement(&self, operation_id: &str) {
    let mut state = self.state.lock().unwrap();
    state
      .start_times
      .insert(operation_id.to_string(), Instant::now());
  }

  /// Close the matching start, append the sample, and return the elapsed
  /// milliseconds. Returns 0.0 without recording anything when no matching
  /// start exists.
  pub fn end_measurement(&self, operation_id: &str, success: bool) -> f64 {
    let mut state = self.state.lock().unwrap();
    let start = match state.start_times.remove(operation_id) {
      Some(start) => start,
      None => return 0.0,
    };

    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    Self::push_sample(&mut state, operation_id, duration_ms, success);
    duration_ms
  }

  /// Append a sample directly, for callers that timed the operation
  /// themselves (concurrent dispatches sharing one operation id).
  pub fn record_sample(&self, operation_id: &str, duration_ms: f64, success: bool) {
    let mut state = self.state.lock().unwrap();
    Self::push_sample(&mut state, operation_id, duration_ms, success);
  }

  /// Clear all samples, pending starts and counters.
  pub fn reset(&self) {
    let mut state = self.state.lock().unwrap();
    state.samples.clear();
    state.start_times.clear();
    state.error_count = 0;
    state.total_count = 0;
  }

  /// Snapshot of all recorded samples, for aggregation.
  pub(crate) fn snapshot(&self) -> HashMap<String, Vec<Sample>> {
    let state = self.state.lock().unwrap();
    state
      .samples
      .iter()
      .map(|(id, ring)| (id.clone(), ring.iter().copied().collect()))
      .collect()
  }

  /// Global (failures, total) counters.
  pub(crate) fn counters(&self) -> (u64, u64) {
    let state = self.state.lock().unwrap();
    (state.error_count, state.total_count)
  }

  fn push_sample(state: &mut RecorderState, operation_id: &str, duration_ms: f64, success: bool) {
    let ring = state.samples.entry(operation_id.to_string()).or_default();
    ring.push_back(Sample {
      duration_ms,
      success,
    });
    if ring.len() > MAX_SAMPLES_PER_OP {
      ring.pop_front();
    }

    state.total_count += 1;
    if !success {
      state.error_count += 1;
    }
  }
}
