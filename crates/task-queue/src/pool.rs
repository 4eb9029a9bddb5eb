use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retry::BackoffPolicy;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::handler::TaskHandler;
use crate::queue::TaskQueue;
use crate::stats::{Counters, QueueStats};
use crate::task::{Payload, Task, TaskStatus};

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 100;

const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Added to a task's priority each time it is re-enqueued.
    pub demotion: i32,
    /// Delay re-enqueues by this backoff (attempt = new retry count).
    /// `None` re-enqueues immediately.
    pub retry_backoff: Option<BackoffPolicy>,
    /// Terminally failed tasks kept in memory for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            demotion: 1,
            retry_backoff: None,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

/// A task that failed terminally.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter<P> {
    pub task: Task<P>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable destination for dead letters.
#[async_trait]
pub trait DeadLetterSink<P: Payload>: Send + Sync {
    async fn record(&self, letter: &DeadLetter<P>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

type HandlerMap<P> = HashMap<<P as Payload>::Kind, Arc<dyn TaskHandler<P>>>;

struct Shared<P: Payload> {
    queue: Arc<TaskQueue<P>>,
    config: PoolConfig,
    handlers: RwLock<HandlerMap<P>>,
    sink: RwLock<Option<Arc<dyn DeadLetterSink<P>>>>,
    counters: Counters,
    dead_letters: Mutex<VecDeque<DeadLetter<P>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Fixed set of workers draining a [`TaskQueue`].
///
/// Each task runs in its own spawned task so a panicking handler only fails
/// that task. Failed tasks are never retried in place: they go back into the
/// queue with a demoted priority until `max_retries` is reached.
pub struct WorkerPool<P: Payload> {
    shared: Arc<Shared<P>>,
    started: AtomicBool,
}

impl<P: Payload> WorkerPool<P> {
    pub fn new(queue: Arc<TaskQueue<P>>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                config,
                handlers: RwLock::new(HashMap::new()),
                sink: RwLock::new(None),
                counters: Counters::default(),
                dead_letters: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn register(&self, kind: P::Kind, handler: Arc<dyn TaskHandler<P>>) {
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(kind, handler).is_some() {
            warn!(%kind, "replacing task handler");
        }
    }

    pub fn set_dead_letter_sink(&self, sink: Arc<dyn DeadLetterSink<P>>) {
        *self.shared.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn queue(&self) -> &Arc<TaskQueue<P>> {
        &self.shared.queue
    }

    pub fn worker_count(&self) -> usize {
        self.shared.config.workers.max(1)
    }

    /// Spawn the workers. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.worker_count();
        self.shared.counters.running.store(true, Ordering::SeqCst);
        for worker in 0..workers {
            let shared = Arc::clone(&self.shared);
            self.shared.tasks.spawn(async move {
                debug!(worker, "worker started");
                while let Some(task) = shared.queue.pop(&shared.shutdown).await {
                    shared.process(task).await;
                    shared.queue.task_done();
                }
                debug!(worker, "worker stopped");
            });
        }
        info!(workers, "worker pool started");
    }

    pub fn stats(&self) -> QueueStats {
        self.shared
            .counters
            .snapshot(self.shared.queue.len(), self.worker_count())
    }

    /// Most recent terminal failures, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter<P>> {
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Nothing queued, running or waiting for a delayed retry.
    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_drained()
            && self.shared.counters.pending_retries.load(Ordering::SeqCst) == 0
    }

    /// Resolve once the pool is idle or `cancel` fires.
    pub async fn wait_idle(&self, cancel: &CancellationToken) {
        while !self.is_idle() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    /// Stop taking tasks, let in-flight handlers finish and abandon pending
    /// delayed retries.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.counters.running.store(false, Ordering::SeqCst);
        info!(stats = ?self.stats(), "worker pool stopped");
    }
}

impl<P: Payload> Shared<P> {
    fn handler(&self, kind: P::Kind) -> Option<Arc<dyn TaskHandler<P>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    async fn process(self: &Arc<Self>, mut task: Task<P>) {
        let kind = task.kind();
        let Some(handler) = self.handler(kind) else {
            warn!(task_id = %task.id, %kind, "no handler registered, dropping task");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        task.status = TaskStatus::Processing;
        self.counters.processing.fetch_add(1, Ordering::SeqCst);
        info!(
            task_id = %task.id,
            %kind,
            priority = task.priority,
            attempt = task.retry_count + 1,
            "processing task"
        );

        let started = Instant::now();
        let running = task.clone();
        let joined = tokio::spawn(async move { handler.handle(&running).await }).await;
        let result = joined.unwrap_or_else(|e| {
            Err(HandlerError::retryable(format!("handler panicked: {e}")))
        });

        match result {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.counters.record_latency(started.elapsed());
                info!(
                    task_id = %task.id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
            }
            Err(err) => self.on_failure(task, err).await,
        }
        self.counters.processing.fetch_sub(1, Ordering::SeqCst);
    }

    async fn on_failure(self: &Arc<Self>, mut task: Task<P>, err: HandlerError) {
        let next = task.retry_count.saturating_add(1);
        task.last_error = Some(err.to_string());

        if err.is_retryable() && next < task.max_retries {
            task.retry_count = next;
            task.priority = task.priority.saturating_add(self.config.demotion);
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                priority = task.priority,
                error = %err,
                "task failed, re-enqueueing"
            );
            self.requeue(task);
            return;
        }

        task.retry_count = next.min(task.max_retries);
        task.status = TaskStatus::Failed;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            task_id = %task.id,
            retry_count = task.retry_count,
            retryable = err.is_retryable(),
            error = %err,
            "task failed permanently"
        );
        self.dead_letter(task, err.to_string()).await;
    }

    fn requeue(self: &Arc<Self>, task: Task<P>) {
        let Some(backoff) = self.config.retry_backoff else {
            self.push_back(task);
            return;
        };

        let delay = backoff.delay(i32::try_from(task.retry_count).unwrap_or(i32::MAX));
        self.counters.pending_retries.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    warn!(task_id = %task.id, "shutdown before delayed retry, task dropped");
                    shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                _ = tokio::time::sleep(delay) => shared.push_back(task),
            }
            shared.counters.pending_retries.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn push_back(&self, task: Task<P>) {
        let id = task.id.clone();
        if let Err(e) = self.queue.requeue(task) {
            warn!(task_id = %id, error = %e, "could not re-enqueue task, dropped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn dead_letter(&self, task: Task<P>, error: String) {
        let letter = DeadLetter {
            task,
            error,
            failed_at: Utc::now(),
        };

        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(sink) = sink
            && let Err(e) = sink.record(&letter).await
        {
            warn!(task_id = %letter.task.id, error = %e, "failed to record dead letter");
        }

        let capacity = self.config.dead_letter_capacity;
        if capacity == 0 {
            return;
        }
        let mut ring = self
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(letter);
    }
}
