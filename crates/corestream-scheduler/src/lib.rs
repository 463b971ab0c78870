#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-scheduler** – Scheduled task execution (component F): tasks
//! are published as events, a worker pool races each task's due time
//! against its competing-consumer lease, and a recurring task that missed
//! one or more ticks either skips straight to the next one or has every
//! missed tick delivered, per [`SchedulerConfig::skippable`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corestream_consensus::{lease_duration, CompetingConsumer, ConsensusBackend, Lease, TimeoutPolicy};
use corestream_stream::{Position, Stream};
use corestream_types::{EventType, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A task's scheduling metadata, independent of its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Stable identifier; a later `create` with the same id replaces it.
    pub id: String,
    /// When the task next becomes due.
    pub after: DateTime<Utc>,
    /// `Some(interval)` for a recurring task, `None` for one-shot.
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEnvelope<T> {
    metadata: TaskMetadata,
    task: T,
}

/// A live snapshot of a task's metadata and payload, as returned by
/// [`ScheduledTasks::tasks`].
#[derive(Debug, Clone)]
pub struct TaskSnapshot<T> {
    /// The task's scheduling metadata.
    pub metadata: TaskMetadata,
    /// The task's payload.
    pub task: T,
}

/// Configuration for a [`ScheduledTasks`] engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Application-defined payload kind published for every task event.
    pub data_type: String,
    /// Schema version of the task payload.
    pub version: String,
    /// Base lease duration for a task due soon; see [`lease_duration`].
    pub base_timeout: Duration,
    /// Number of concurrent task executors.
    pub workers: usize,
    /// Whether a recurring task that missed one or more ticks should skip
    /// straight to the next one (`true`) or have every missed tick delivered
    /// for execution (`false`).
    pub skippable: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            data_type: String::new(),
            version: "1.0.0".into(),
            base_timeout: Duration::from_secs(30),
            workers: 1,
            skippable: true,
        }
    }
}

impl SchedulerConfig {
    /// Build a config for `data_type`, with the other fields at their
    /// defaults (one worker, a 30s base timeout, catch-up skipping on).
    pub fn new(data_type: impl Into<String>) -> Self {
        SchedulerConfig {
            data_type: data_type.into(),
            ..Default::default()
        }
    }

    /// Override the schema version (default `"1.0.0"`).
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Override the base lease timeout.
    pub fn base_timeout(mut self, base_timeout: Duration) -> Self {
        self.base_timeout = base_timeout;
        self
    }

    /// Override the worker pool size.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override whether missed recurring ticks are skipped (`true`, the
    /// default) or each delivered for execution (`false`).
    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }
}

/// Executes a task's payload when it comes due.
///
/// `cancel` fires if the task's lease is lost mid-execution; an executor
/// that can observe it should stop promptly. Returning `false` means the
/// task was not completed and should be redelivered once its lease expires
/// — it is *not* acknowledged, so another replica (or this one, later)
/// will pick it up again.
#[async_trait]
pub trait TaskExecutor<T>: Send + Sync {
    /// Run the task. `true` acknowledges it; `false` leaves it for redelivery.
    async fn execute(&self, task: &T, cancel: &CancellationToken) -> bool;
}

struct Job<T> {
    envelope: TaskEnvelope<T>,
    lease: Lease,
}

struct Inner<T> {
    stream: corestream_stream::TypedStream<TaskEnvelope<T>>,
    backend: Arc<dyn ConsensusBackend>,
    data_type: String,
    version: String,
    skippable: bool,
    tasks: std::sync::Mutex<Vec<TaskEnvelope<T>>>,
}

/// A scheduled-task engine over a single task stream.
#[derive(Clone)]
pub struct ScheduledTasks<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ScheduledTasks<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start the engine: `config.workers` concurrent executors race incoming
    /// tasks against their leases, with `config.base_timeout` sizing a lease
    /// for a task due soon (see [`lease_duration`]).
    pub fn spawn(
        config: SchedulerConfig,
        stream: Stream,
        backend: Arc<dyn ConsensusBackend>,
        executor: Arc<dyn TaskExecutor<T>>,
        cancel: CancellationToken,
    ) -> ScheduledTasks<T> {
        let SchedulerConfig {
            data_type,
            version,
            base_timeout,
            workers,
            skippable,
        } = config;
        let typed_stream = stream.typed::<TaskEnvelope<T>>();

        let inner = Arc::new(Inner {
            stream: typed_stream.clone(),
            backend: backend.clone(),
            data_type,
            version,
            skippable,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let (exec_tx, exec_rx) = mpsc::channel::<Job<T>>(1);
        let exec_rx = Arc::new(AsyncMutex::new(exec_rx));

        for worker_id in 0..workers.max(1) {
            let exec_rx = exec_rx.clone();
            let inner = inner.clone();
            let executor = executor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = exec_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { return };
                    run_job(&inner, executor.as_ref(), job, worker_id, &cancel).await;
                }
            });
        }

        let handler_inner = inner.clone();
        let handler_cancel = cancel.clone();
        let timeout_policy: TimeoutPolicy<TaskEnvelope<T>> =
            Arc::new(move |event| lease_duration(Utc::now(), event.data.metadata.after, base_timeout));
        let competing = CompetingConsumer::with_timeout_policy(typed_stream, backend, timeout_policy);
        tokio::spawn(async move {
            let mut incoming = competing.consume(Position::START, handler_cancel.clone());
            while let Some(competing_event) = incoming.recv().await {
                if handler_cancel.is_cancelled() {
                    return;
                }
                handle_task_event(&handler_inner, competing_event, &exec_tx, &handler_cancel).await;
            }
        });

        ScheduledTasks { inner }
    }

    /// Publish a task; `interval` makes it recurring.
    pub async fn create(&self, id: impl Into<String>, after: DateTime<Utc>, interval: Option<Duration>, task: T) -> Result<()> {
        let id = id.into();
        let metadata = TaskMetadata { id: id.clone(), after, interval };
        let envelope = TaskEnvelope { metadata, task };
        let key = corestream_types::hash_key(&id);
        self.inner
            .stream
            .store(EventType::Created, self.inner.data_type.clone(), self.inner.version.clone(), key, &envelope)
            .await?;
        Ok(())
    }

    /// A snapshot of every task this replica currently knows about.
    pub fn tasks(&self) -> Vec<TaskSnapshot<T>> {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .map(|e| TaskSnapshot {
                metadata: e.metadata.clone(),
                task: e.task.clone(),
            })
            .collect()
    }
}

async fn handle_task_event<T>(
    inner: &Arc<Inner<T>>,
    competing_event: corestream_consensus::CompetingEvent<TaskEnvelope<T>>,
    exec_tx: &mpsc::Sender<Job<T>>,
    cancel: &CancellationToken,
) where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let envelope = competing_event.event.data;
    let lease = competing_event.lease;
    upsert_task(inner, envelope.clone());

    let now = Utc::now();
    if inner.skippable {
        if let Some(interval) = envelope.metadata.interval {
            if now > envelope.metadata.after + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()) {
                // Caught up past this tick already: schedule the next one and
                // acknowledge without executing — no backlog of missed ticks.
                let next_after = envelope.metadata.after + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
                if let Err(e) = publish_next(inner, &envelope, next_after, interval).await {
                    warn!(error = %e, id = %envelope.metadata.id, "failed to publish catch-up tick");
                }
                let _ = inner.backend.release(lease).await;
                return;
            }
        }
    }

    let wait = (envelope.metadata.after - now).to_std().unwrap_or(Duration::ZERO);
    let lease_window = (lease.expires_at() - now).to_std().unwrap_or(Duration::ZERO);
    if wait > lease_window {
        // This lease was sized for the task's `after`, but didn't cover the
        // full wait (e.g. a retry after a lost lease, or clock drift); let
        // it lapse so a later pass, acquiring a fresh lease, claims it.
        debug!(id = %envelope.metadata.id, "task due too far out for this lease, letting it expire");
        return;
    }

    let cancel = cancel.clone();
    let lost = lease.id().to_string();
    let exec_tx = exec_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if exec_tx.send(Job { envelope, lease }).await.is_err() {
                    debug!(id = %lost, "executor pool gone, dropping task");
                }
            }
            _ = lease.lost() => {
                debug!(id = %lost, "lease lost before task became due");
            }
            _ = cancel.cancelled() => {}
        }
    });
}

async fn run_job<T>(inner: &Arc<Inner<T>>, executor: &dyn TaskExecutor<T>, job: Job<T>, worker_id: usize, cancel: &CancellationToken)
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let Job { envelope, lease } = job;
    let ok = executor.execute(&envelope.task, cancel).await;
    if !ok {
        debug!(worker_id, id = %envelope.metadata.id, "task execution reported failure, leaving for redelivery");
        return;
    }
    if lease.is_lost() {
        debug!(worker_id, id = %envelope.metadata.id, "lease lost during execution, not acknowledging");
        return;
    }
    if let Some(interval) = envelope.metadata.interval {
        let next_after = envelope.metadata.after + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = publish_next(inner, &envelope, next_after, interval).await {
            warn!(error = %e, id = %envelope.metadata.id, "failed to publish next recurrence");
        }
    }
    let _ = inner.backend.release(lease).await;
}

async fn publish_next<T>(inner: &Arc<Inner<T>>, envelope: &TaskEnvelope<T>, next_after: DateTime<Utc>, interval: Duration) -> Result<()>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let next = TaskEnvelope {
        metadata: TaskMetadata {
            id: envelope.metadata.id.clone(),
            after: next_after,
            interval: Some(interval),
        },
        task: envelope.task.clone(),
    };
    let key = corestream_types::hash_key(&next.metadata.id);
    inner
        .stream
        .store(EventType::Created, inner.data_type.clone(), inner.version.clone(), key, &next)
        .await?;
    Ok(())
}

fn upsert_task<T: Clone>(inner: &Inner<T>, envelope: TaskEnvelope<T>) {
    let mut tasks = inner.tasks.lock().unwrap();
    if let Some(existing) = tasks.iter_mut().find(|t| t.metadata.id == envelope.metadata.id) {
        *existing = envelope;
    } else {
        tasks.push(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corestream_store::{EventStore, StoreConfig};
    use corestream_stream::NoEncryption;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload(u64);

    struct CountingExecutor {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor<Payload> for CountingExecutor {
        async fn execute(&self, _task: &Payload, _cancel: &CancellationToken) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    async fn open_scheduler(
        dir: &std::path::Path,
        executor: Arc<dyn TaskExecutor<Payload>>,
        config: SchedulerConfig,
    ) -> (ScheduledTasks<Payload>, CancellationToken) {
        let store = EventStore::open("tasks", StoreConfig::new(dir).without_fsync()).await.unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption));
        let backend = Arc::new(corestream_consensus::SingleNodeConsensus::new());
        let cancel = CancellationToken::new();
        let tasks = ScheduledTasks::spawn(config, stream, backend, executor, cancel.clone());
        (tasks, cancel)
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::new("jobs").base_timeout(Duration::from_secs(5)).workers(2)
    }

    #[tokio::test]
    async fn one_shot_task_runs_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let (scheduler, cancel) =
            open_scheduler(dir.path(), Arc::new(CountingExecutor { runs: runs.clone() }), test_config()).await;

        scheduler.create("t1", Utc::now(), None, Payload(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn tasks_lists_known_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let (scheduler, cancel) = open_scheduler(dir.path(), Arc::new(CountingExecutor { runs }), test_config()).await;

        scheduler.create("t2", Utc::now(), None, Payload(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = scheduler.tasks();
        assert!(snapshot.iter().any(|t| t.metadata.id == "t2"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn skippable_catch_up_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig::new("jobs").base_timeout(Duration::from_secs(5)).workers(1);
        let (scheduler, cancel) =
            open_scheduler(dir.path(), Arc::new(CountingExecutor { runs: runs.clone() }), config).await;

        let after = Utc::now() - chrono::Duration::milliseconds(750);
        scheduler
            .create("recurring", after, Some(Duration::from_millis(50)), Payload(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let count = runs.load(Ordering::SeqCst);
        assert!(count <= 2, "expected catch-up to skip missed ticks, got {count}");
        cancel.cancel();
    }

    #[tokio::test]
    async fn non_skippable_delivers_every_missed_tick() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig::new("jobs")
            .base_timeout(Duration::from_secs(5))
            .workers(1)
            .skippable(false);
        let (scheduler, cancel) =
            open_scheduler(dir.path(), Arc::new(CountingExecutor { runs: runs.clone() }), config).await;

        let after = Utc::now() - chrono::Duration::milliseconds(750);
        scheduler
            .create("recurring", after, Some(Duration::from_millis(50)), Payload(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let count = runs.load(Ordering::SeqCst);
        assert!(count >= 10, "expected every missed tick to be delivered, got {count}");
        cancel.cancel();
    }
}
