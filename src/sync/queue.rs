//! The background sync queue worker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use super::conflict::{
  ConflictResolution, ConflictStrategy, LocalFieldsWin, MergePolicy, PendingConflict,
};
use super::task::{SyncResult, SyncTask, TaskId, TaskStatus};
use super::SyncError;
use crate::cache::{CacheStorage, PersistedEntry};
use crate::config::{AdaptiveConfig, SyncConfig};
use crate::perf::{MetricRecorder, OP_SYNC};
use crate::source::{DataSource, MutateOutcome, Operation, SourceError};

/// Default base delay for exponential backoff between retries.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff never grows past this, whatever the attempt count.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Artificial latency injected by `simulate_slow_network`.
const SLOW_NETWORK_DELAY: Duration = Duration::from_millis(150);

/// Handle to an enqueued task. Await [`TaskHandle::result`] for the
/// terminal outcome.
pub struct TaskHandle {
  pub id: TaskId,
  rx: oneshot::Receiver<SyncResult>,
}

impl TaskHandle {
  pub async fn result(self) -> Result<SyncResult, SyncError> {
    self.rx.await.map_err(|_| SyncError::Closed)
  }
}

/// Queue counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncQueueStats {
  pub pending: usize,
  pub in_flight: usize,
  pub awaiting_resolution: usize,
  pub total: usize,
}

struct QueueState {
  /// Tasks in enqueue order; same-key ordering relies on this
  tasks: Vec<SyncTask>,
  waiters: std::collections::HashMap<TaskId, oneshot::Sender<SyncResult>>,
}

struct QueueInner {
  source: Arc<dyn DataSource>,
  config: Arc<AdaptiveConfig>,
  recorder: Arc<MetricRecorder>,
  merge_policy: Box<dyn MergePolicy>,
  backoff_base: Duration,
  state: Mutex<QueueState>,
  wake: Arc<Notify>,
  conflict_tx: mpsc::UnboundedSender<PendingConflict>,
  conflict_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingConflict>>>,
  /// Persisted under one key so pending mutations survive restarts
  storage: Option<Arc<dyn CacheStorage>>,
  storage_namespace: String,
}

/// Storage key holding the serialized pending-task list.
const QUEUE_STORAGE_KEY: &str = "pending-tasks";

/// Ordered queue of pending mutations, optionally persisted so unsent
/// work survives a restart.
///
/// A spawned worker wakes on every enqueue (and at least once per
/// `sync_interval`) and dispatches up to `batch_size` ready tasks with
/// distinct target keys concurrently. Tasks sharing a key dispatch
/// strictly FIFO with at most one in flight at a time; that invariant is
/// structural, since a cycle selects at most one task per key and awaits
/// the whole batch before the next selection.
///
/// The worker exits once every queue handle has been dropped.
pub struct SyncQueue {
  inner: Arc<QueueInner>,
}

impl SyncQueue {
  pub fn new(
    source: Arc<dyn DataSource>,
    config: Arc<AdaptiveConfig>,
    recorder: Arc<MetricRecorder>,
  ) -> Self {
    Self::with_options(
      source,
      config,
      recorder,
      Box::new(LocalFieldsWin),
      DEFAULT_BACKOFF_BASE,
    )
  }

  /// Queue whose pending tasks survive restarts: tasks left over from a
  /// previous session are reloaded from storage and dispatched again
  /// (their callers are gone, so results go unreported).
  pub fn with_storage(
    source: Arc<dyn DataSource>,
    config: Arc<AdaptiveConfig>,
    recorder: Arc<MetricRecorder>,
    storage: Arc<dyn CacheStorage>,
  ) -> Self {
    Self::build(
      source,
      config,
      recorder,
      Box::new(LocalFieldsWin),
      DEFAULT_BACKOFF_BASE,
      Some(storage),
    )
  }

  /// Full constructor with a custom merge policy and backoff base.
  pub fn with_options(
    source: Arc<dyn DataSource>,
    config: Arc<AdaptiveConfig>,
    recorder: Arc<MetricRecorder>,
    merge_policy: Box<dyn MergePolicy>,
    backoff_base: Duration,
  ) -> Self {
    Self::build(source, config, recorder, merge_policy, backoff_base, None)
  }

  fn build(
    source: Arc<dyn DataSource>,
    config: Arc<AdaptiveConfig>,
    recorder: Arc<MetricRecorder>,
    merge_policy: Box<dyn MergePolicy>,
    backoff_base: Duration,
    storage: Option<Arc<dyn CacheStorage>>,
  ) -> Self {
    let storage_namespace = format!(
      "{}:sync-queue",
      config.effective().cache.storage_key_prefix
    );
    let restored = storage
      .as_deref()
      .map(|storage| QueueInner::load_tasks(storage, &storage_namespace))
      .unwrap_or_default();

    let (conflict_tx, conflict_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(QueueInner {
      source,
      config,
      recorder,
      merge_policy,
      backoff_base,
      state: Mutex::new(QueueState {
        tasks: restored,
        waiters: std::collections::HashMap::new(),
      }),
      wake: Arc::new(Notify::new()),
      conflict_tx,
      conflict_rx: Mutex::new(Some(conflict_rx)),
      storage,
      storage_namespace,
    });

    Self::spawn_worker(&inner);
    inner.wake.notify_one();
    Self { inner }
  }

  /// Enqueue a mutation. Fails when the queue is at `max_queue_size`.
  pub fn enqueue(
    &self,
    operation: Operation,
    target_key: &str,
    payload: Value,
  ) -> Result<TaskHandle, SyncError> {
    let max_queue_size = self.inner.config.effective().sync.max_queue_size;
    let task = SyncTask::new(operation, target_key, payload);
    let id = task.id;
    let (tx, rx) = oneshot::channel();

    {
      let mut state = self.inner.state.lock().unwrap();
      if state.tasks.len() >= max_queue_size {
        return Err(SyncError::QueueFull(state.tasks.len()));
      }
      state.tasks.push(task);
      state.waiters.insert(id, tx);
      self.inner.persist_tasks(&state.tasks);
    }

    self.inner.wake.notify_one();
    Ok(TaskHandle { id, rx })
  }

  /// Resolve a conflict the queue parked with `prompt_user`.
  pub fn resolve(&self, task_id: TaskId, resolution: ConflictResolution) -> Result<(), SyncError> {
    let completed = {
      let mut state = self.inner.state.lock().unwrap();
      let task = state
        .tasks
        .iter_mut()
        .find(|task| task.id == task_id && task.status == TaskStatus::AwaitingResolution)
        .ok_or_else(|| SyncError::NotFound(task_id.to_string()))?;

      let resolved = match resolution {
        ConflictResolution::UseServer => {
          let value = task
            .conflict
            .take()
            .map(|conflict| conflict.server_value)
            .unwrap_or(Value::Null);
          Some((task_id, SyncResult::Overridden { value }))
        }
        ConflictResolution::UseLocal => {
          task.status = TaskStatus::Pending;
          task.conflict = None;
          task.next_retry = None;
          None
        }
        ConflictResolution::UseValue(value) => {
          task.payload = value;
          task.status = TaskStatus::Pending;
          task.conflict = None;
          task.next_retry = None;
          None
        }
      };
      self.inner.persist_tasks(&state.tasks);
      resolved
    };

    if let Some((id, result)) = completed {
      self.inner.complete(id, result);
    }
    self.inner.wake.notify_one();
    Ok(())
  }

  /// Take the conflict channel. Yields each `prompt_user` conflict once;
  /// callable once per queue.
  pub fn conflicts(&self) -> Option<mpsc::UnboundedReceiver<PendingConflict>> {
    self.inner.conflict_rx.lock().unwrap().take()
  }

  pub fn stats(&self) -> SyncQueueStats {
    let state = self.inner.state.lock().unwrap();
    let mut stats = SyncQueueStats {
      total: state.tasks.len(),
      ..SyncQueueStats::default()
    };
    for task in &state.tasks {
      match task.status {
        TaskStatus::Pending => stats.pending += 1,
        TaskStatus::InFlight => stats.in_flight += 1,
        TaskStatus::AwaitingResolution => stats.awaiting_resolution += 1,
        _ => {}
      }
    }
    stats
  }

  /// Status of a queued task; None once the task reached a terminal state
  /// and was removed.
  pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
    let state = self.inner.state.lock().unwrap();
    state
      .tasks
      .iter()
      .find(|task| task.id == task_id)
      .map(|task| task.status)
  }

  fn spawn_worker(inner: &Arc<QueueInner>) {
    let weak = Arc::downgrade(inner);
    let wake = Arc::clone(&inner.wake);

    tokio::spawn(async move {
      loop {
        let wait = match weak.upgrade() {
          Some(inner) => inner.next_wait(&inner.config.effective()),
          None => break,
        };

        tokio::select! {
          _ = wake.notified() => {}
          _ = tokio::time::sleep(wait) => {}
        }

        match weak.upgrade() {
          Some(inner) => inner.process_cycle().await,
          None => break,
        }
      }
    });
  }
}

impl Clone for SyncQueue {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl QueueInner {
  /// How long the worker may sleep before something could become ready.
  fn next_wait(&self, config: &SyncConfig) -> Duration {
    let interval = Duration::from_millis(config.sync.sync_interval_ms);
    if config.development.simulate_offline_mode {
      return interval;
    }

    let state = self.state.lock().unwrap();
    let now = Instant::now();
    let mut wait = interval;
    let mut seen_keys = HashSet::new();

    for task in &state.tasks {
      // Only the head task per key can dispatch; later ones wait for it
      if !seen_keys.insert(task.target_key.clone()) {
        continue;
      }
      if task.status != TaskStatus::Pending {
        continue;
      }
      match task.next_retry {
        None => return Duration::ZERO,
        Some(at) if at <= now => return Duration::ZERO,
        Some(at) => wait = wait.min(at - now),
      }
    }

    wait.max(Duration::from_millis(1))
  }

  async fn process_cycle(self: Arc<Self>) {
    let config = self.config.effective();
    if config.development.simulate_offline_mode {
      return;
    }

    let batch = self.select_batch(&config);
    if batch.is_empty() {
      return;
    }

    let dispatches = batch.into_iter().map(|task| {
      let inner = Arc::clone(&self);
      let config = config.clone();
      async move { inner.dispatch(task, &config).await }
    });
    futures::future::join_all(dispatches).await;
  }

  /// Pick up to `batch_size` ready tasks, at most one per target key,
  /// preserving enqueue order, and mark them in flight.
  fn select_batch(&self, config: &SyncConfig) -> Vec<SyncTask> {
    let mut state = self.state.lock().unwrap();
    let now = Instant::now();
    let mut seen_keys = HashSet::new();
    let mut batch = Vec::new();

    for task in state.tasks.iter_mut() {
      if batch.len() >= config.sync.batch_size {
        break;
      }
      if !seen_keys.insert(task.target_key.clone()) {
        continue;
      }
      if !task.is_ready(now) {
        continue;
      }

      task.status = TaskStatus::InFlight;
      batch.push(task.clone());
    }

    batch
  }

  async fn dispatch(&self, mut task: SyncTask, config: &SyncConfig) {
    if config.development.simulate_slow_network {
      tokio::time::sleep(SLOW_NETWORK_DELAY).await;
    }

    let timeout = Duration::from_millis(config.sync.request_timeout_ms);
    let started = Instant::now();
    let outcome = tokio::time::timeout(
      timeout,
      self
        .source
        .mutate(task.operation, &task.target_key, &task.payload),
    )
    .await
    .unwrap_or(Err(SourceError::Timeout(config.sync.request_timeout_ms)));
    let elapsed = started.elapsed().as_secs_f64() * 1000.0;

    task.attempts += 1;
    task.last_attempt_at = Some(Utc::now());

    if config.cache.enable_metrics {
      self.recorder.record_sample(OP_SYNC, elapsed, outcome.is_ok());
    }

    match outcome {
      Ok(MutateOutcome::Applied(value)) => {
        self.complete(task.id, SyncResult::Committed { value });
      }
      Ok(MutateOutcome::Conflict(descriptor)) => {
        self.handle_conflict(task, descriptor, config);
      }
      Err(error) if error.is_retryable() => {
        if task.attempts > config.sync.retry_attempts {
          warn!(
            "Task {} for {} failed permanently after {} attempts: {}",
            task.id, task.target_key, task.attempts, error
          );
          self.complete(
            task.id,
            SyncResult::Failed {
              error: error.to_string(),
            },
          );
        } else {
          debug!(
            "Task {} for {} failed (attempt {}), retrying: {}",
            task.id, task.target_key, task.attempts, error
          );
          task.status = TaskStatus::Pending;
          task.next_retry = Some(Instant::now() + self.backoff(task.attempts));
          self.requeue(task);
          self.wake.notify_one();
        }
      }
      Err(error) => {
        warn!(
          "Task {} for {} failed permanently: {}",
          task.id, task.target_key, error
        );
        self.complete(
          task.id,
          SyncResult::Failed {
            error: error.to_string(),
          },
        );
      }
    }
  }

  fn handle_conflict(
    &self,
    mut task: SyncTask,
    descriptor: crate::source::ConflictDescriptor,
    config: &SyncConfig,
  ) {
    match config.sync.conflict_strategy {
      ConflictStrategy::ServerWins => {
        self.complete(
          task.id,
          SyncResult::Overridden {
            value: descriptor.server_value,
          },
        );
      }
      ConflictStrategy::ClientWins | ConflictStrategy::Merge => {
        // Loop protection: a conflict that survives the retry budget is
        // reported as a permanent failure
        if task.attempts > config.sync.retry_attempts {
          self.complete(
            task.id,
            SyncResult::Failed {
              error: format!(
                "conflict on {} unresolved after {} attempts",
                task.target_key, task.attempts
              ),
            },
          );
          return;
        }

        if config.sync.conflict_strategy == ConflictStrategy::Merge {
          task.payload = self
            .merge_policy
            .merge(&descriptor.server_value, &task.payload);
        }
        task.status = TaskStatus::Pending;
        task.next_retry = Some(Instant::now() + self.backoff(task.attempts));
        self.requeue(task);
        self.wake.notify_one();
      }
      ConflictStrategy::PromptUser => {
        debug!(
          "Task {} for {} conflicted, awaiting resolution",
          task.id, task.target_key
        );
        let pending = PendingConflict {
          task_id: task.id,
          target_key: task.target_key.clone(),
          descriptor: descriptor.clone(),
        };
        task.status = TaskStatus::AwaitingResolution;
        task.conflict = Some(descriptor);
        self.requeue(task);
        let _ = self.conflict_tx.send(pending);
      }
    }
  }

  fn backoff(&self, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(16));
    (self.backoff_base * factor).min(MAX_BACKOFF)
  }

  /// Remove the task and deliver its terminal result.
  fn complete(&self, task_id: TaskId, result: SyncResult) {
    let waiter = {
      let mut state = self.state.lock().unwrap();
      state.tasks.retain(|task| task.id != task_id);
      self.persist_tasks(&state.tasks);
      state.waiters.remove(&task_id)
    };
    if let Some(tx) = waiter {
      let _ = tx.send(result);
    }
  }

  /// Write an updated task back into the queue.
  fn requeue(&self, task: SyncTask) {
    let mut state = self.state.lock().unwrap();
    if let Some(stored) = state.tasks.iter_mut().find(|stored| stored.id == task.id) {
      *stored = task;
    }
    self.persist_tasks(&state.tasks);
  }

  fn load_tasks(storage: &dyn CacheStorage, namespace: &str) -> Vec<SyncTask> {
    let entry = match storage.get(namespace, QUEUE_STORAGE_KEY) {
      Ok(Some(entry)) => entry,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!("Failed to read persisted sync queue: {}", e);
        return Vec::new();
      }
    };

    match serde_json::from_slice::<Vec<SyncTask>>(&entry.payload) {
      Ok(mut tasks) => {
        // Whatever was in flight when the session died never completed
        for task in &mut tasks {
          if task.status == TaskStatus::InFlight {
            task.status = TaskStatus::Pending;
          }
        }
        if !tasks.is_empty() {
          debug!("Restored {} pending sync tasks from storage", tasks.len());
        }
        tasks
      }
      Err(e) => {
        warn!("Corrupted sync queue snapshot, starting empty: {}", e);
        tasks_snapshot_cleanup(storage, namespace);
        Vec::new()
      }
    }
  }

  fn persist_tasks(&self, tasks: &[SyncTask]) {
    let Some(storage) = self.storage.as_deref() else {
      return;
    };
    let payload = match serde_json::to_vec(tasks) {
      Ok(payload) => payload,
      Err(e) => {
        warn!("Failed to serialize sync queue: {}", e);
        return;
      }
    };

    let now = Utc::now();
    let entry = PersistedEntry {
      payload,
      compressed: false,
      fetched_at: now,
      fresh_until: now,
      stale_until: now,
    };
    if let Err(e) = storage.put(&self.storage_namespace, QUEUE_STORAGE_KEY, &entry) {
      warn!("Failed to persist sync queue, continuing in-memory: {}", e);
    }
  }
}

fn tasks_snapshot_cleanup(storage: &dyn CacheStorage, namespace: &str) {
  if let Err(e) = storage.remove(namespace, QUEUE_STORAGE_KEY) {
    warn!("Failed to drop corrupted sync queue snapshot: {}", e);
  }
}
