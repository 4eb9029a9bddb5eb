use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use retry::{Context, Retry, RetryPolicy};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CheckpointError, OperationError};
use crate::store::{Checkpoint, CheckpointMetadata, CheckpointStore, OperationStatus};

pub const DEFAULT_COMPLETED_GRACE: Duration = Duration::from_secs(5 * 60);

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RollbackFn = Box<dyn Fn(u32, Map<String, Value>) -> BoxFuture<Result<(), OperationError>> + Send + Sync>;

/// Brief retry for checkpoint writes; they are local disk writes.
fn default_write_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
        multiplier: 2.0,
        jitter: false,
    }
}

struct Tracker {
    step: u32,
    state: Map<String, Value>,
    status: OperationStatus,
    started_at: DateTime<Utc>,
    error: Option<String>,
}

/// Everything a step function needs, shared by clones of the handle.
struct Shared {
    id: String,
    total_steps: u32,
    store: Arc<CheckpointStore>,
    write_policy: RetryPolicy,
    ctx: Context,
    started_as: OperationStatus,
}

impl Shared {
    fn snapshot(&self, tracker: &Tracker) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4().to_string(),
            operation_id: self.id.clone(),
            step: tracker.step,
            total_steps: self.total_steps,
            state: tracker.state.clone(),
            timestamp: Utc::now(),
            metadata: CheckpointMetadata {
                status: tracker.status,
                error: tracker.error.clone(),
                started_at: tracker.started_at,
            },
        }
    }

    async fn persist(&self, ctx: &Context, tracker: &Tracker) -> Result<(), OperationError> {
        let checkpoint = self.snapshot(tracker);
        Retry::new(self.write_policy.clone())
            .retry_if(|e: &CheckpointError| matches!(e, CheckpointError::Io(_)))
            .run(ctx, |_| self.store.save(&checkpoint))
            .await?;
        Ok(())
    }
}

/// Passed to the step function of [`ResumableOperation::run`].
///
/// Every mutation is persisted before it returns; a persistence failure is
/// returned to the caller rather than swallowed.
#[derive(Clone)]
pub struct OperationHandle {
    shared: Arc<Shared>,
    tracker: Arc<Mutex<Tracker>>,
}

impl OperationHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn total_steps(&self) -> u32 {
        self.shared.total_steps
    }

    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    /// `Fresh` or `Resumed`.
    pub fn started_as(&self) -> OperationStatus {
        self.shared.started_as
    }

    pub async fn current_step(&self) -> u32 {
        self.tracker.lock().await.step
    }

    pub async fn status(&self) -> OperationStatus {
        self.tracker.lock().await.status
    }

    pub async fn state(&self) -> Map<String, Value> {
        self.tracker.lock().await.state.clone()
    }

    /// Typed read of one state key. `None` when absent or of another shape.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let tracker = self.tracker.lock().await;
        let value = tracker.state.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    /// Merge `partial` into the state and persist.
    pub async fn save_state(&self, partial: Map<String, Value>) -> Result<(), OperationError> {
        let mut tracker = self.tracker.lock().await;
        tracker.state.extend(partial);
        tracker.status = OperationStatus::Running;
        self.shared.persist(&self.shared.ctx, &tracker).await
    }

    /// Advance one step and persist. Returns the new step.
    pub async fn next_step(&self) -> Result<u32, OperationError> {
        let mut tracker = self.tracker.lock().await;
        if tracker.step >= self.shared.total_steps {
            return Err(OperationError::InvalidStep {
                step: tracker.step + 1,
                total: self.shared.total_steps,
            });
        }
        tracker.step += 1;
        tracker.status = OperationStatus::Running;
        self.shared.persist(&self.shared.ctx, &tracker).await?;
        debug!(operation_id = %self.shared.id, step = tracker.step, "step completed");
        Ok(tracker.step)
    }
}

/// Result of a successful [`ResumableOperation::run`].
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub started_as: OperationStatus,
    pub step: u32,
    pub state: Map<String, Value>,
}

/// Multi-step unit of work that checkpoints after every step and picks up
/// where it left off when run again with the same id.
pub struct ResumableOperation {
    id: String,
    total_steps: u32,
    store: Arc<CheckpointStore>,
    rollback: Option<RollbackFn>,
    completed_grace: Duration,
    write_policy: RetryPolicy,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ResumableOperation {
    pub fn new(id: impl Into<String>, total_steps: u32, store: Arc<CheckpointStore>) -> Self {
        Self {
            id: id.into(),
            total_steps,
            store,
            rollback: None,
            completed_grace: DEFAULT_COMPLETED_GRACE,
            write_policy: default_write_policy(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Called with the last step and state after a failure, and when a
    /// transaction unwinds this operation.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(u32, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move |step, state| Box::pin(rollback(step, state))));
        self
    }

    /// How long a completed checkpoint is kept before deletion.
    pub fn with_completed_grace(mut self, grace: Duration) -> Self {
        self.completed_grace = grace;
        self
    }

    pub fn with_write_policy(mut self, policy: RetryPolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Spawn delayed deletions on `tasks`; canceling `shutdown` abandons them
    /// and keeps the checkpoint.
    pub fn with_background(mut self, shutdown: CancellationToken, tasks: TaskTracker) -> Self {
        self.shutdown = shutdown;
        self.tasks = tasks;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `work` from the last checkpoint, or from step 0 if there is none.
    ///
    /// A checkpoint already marked completed is not run again.
    pub async fn run<F, Fut>(&self, ctx: &Context, work: F) -> Result<OperationOutcome, OperationError>
    where
        F: FnOnce(OperationHandle) -> Fut,
        Fut: Future<Output = Result<(), OperationError>>,
    {
        ctx.check()?;

        let (tracker, started_as) = match self.store.load(&self.id).await {
            Ok(checkpoint) if checkpoint.metadata.status == OperationStatus::Completed => {
                info!(operation_id = %self.id, "operation already completed");
                self.schedule_deletion();
                return Ok(OperationOutcome {
                    started_as: OperationStatus::Completed,
                    step: checkpoint.step,
                    state: checkpoint.state,
                });
            }
            Ok(checkpoint) => {
                info!(
                    operation_id = %self.id,
                    step = checkpoint.step,
                    total_steps = self.total_steps,
                    "resuming operation from checkpoint"
                );
                let tracker = Tracker {
                    step: checkpoint.step.min(self.total_steps),
                    state: checkpoint.state,
                    status: OperationStatus::Resumed,
                    started_at: checkpoint.metadata.started_at,
                    error: None,
                };
                (tracker, OperationStatus::Resumed)
            }
            Err(CheckpointError::NotFound(_)) => {
                debug!(operation_id = %self.id, "starting fresh operation");
                let tracker = Tracker {
                    step: 0,
                    state: Map::new(),
                    status: OperationStatus::Fresh,
                    started_at: Utc::now(),
                    error: None,
                };
                (tracker, OperationStatus::Fresh)
            }
            Err(e) => return Err(e.into()),
        };

        let shared = Arc::new(Shared {
            id: self.id.clone(),
            total_steps: self.total_steps,
            store: Arc::clone(&self.store),
            write_policy: self.write_policy.clone(),
            ctx: ctx.clone(),
            started_as,
        });
        shared.persist(ctx, &tracker).await?;

        let tracker = Arc::new(Mutex::new(tracker));
        let handle = OperationHandle {
            shared: Arc::clone(&shared),
            tracker: Arc::clone(&tracker),
        };

        let result = work(handle).await;
        let mut tracker = tracker.lock().await;

        match result {
            Ok(()) => {
                tracker.status = OperationStatus::Completed;
                tracker.error = None;
                shared.persist(ctx, &tracker).await?;
                info!(operation_id = %self.id, step = tracker.step, "operation completed");
                self.schedule_deletion();
                Ok(OperationOutcome {
                    started_as,
                    step: tracker.step,
                    state: tracker.state.clone(),
                })
            }
            Err(err) => {
                error!(operation_id = %self.id, step = tracker.step, error = %err, "operation failed");
                tracker.status = OperationStatus::Failed;
                tracker.error = Some(err.to_string());
                // The failure record is written even when `ctx` is what failed.
                if let Err(e) = shared.persist(&Context::background(), &tracker).await {
                    warn!(operation_id = %self.id, error = %e, "failed to persist failed checkpoint");
                }
                let (step, state) = (tracker.step, tracker.state.clone());
                drop(tracker);
                if let Err(e) = self.rollback(step, state).await {
                    warn!(operation_id = %self.id, error = %e, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Invoke the rollback callback, if any.
    pub async fn rollback(&self, step: u32, state: Map<String, Value>) -> Result<(), OperationError> {
        match &self.rollback {
            Some(rollback) => {
                info!(operation_id = %self.id, step, "rolling back operation");
                rollback(step, state).await
            }
            None => Ok(()),
        }
    }

    fn schedule_deletion(&self) {
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let grace = self.completed_grace;
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(operation_id = %id, "shutdown before checkpoint deletion");
                }
                _ = tokio::time::sleep(grace) => {
                    // A rerun in the meantime may have replaced the checkpoint.
                    match store.load(&id).await {
                        Ok(cp) if cp.metadata.status == OperationStatus::Completed => {
                            if let Err(e) = store.delete(&id).await {
                                warn!(operation_id = %id, error = %e, "failed to delete completed checkpoint");
                            }
                        }
                        Ok(_) | Err(CheckpointError::NotFound(_)) => {}
                        Err(e) => warn!(operation_id = %id, error = %e, "failed to read checkpoint before deletion"),
                    }
                }
            }
        });
    }
}
