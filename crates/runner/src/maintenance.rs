//! Periodic housekeeping: queue reports and the stale sweep.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::CheckpointStore;
use chrono::{DateTime, Utc};
use sandbox::SandboxRegistry;
use serde::Serialize;
use task_queue::{HandlerError, Task, TaskHandler, WorkerPool};
use tracing::{debug, info, warn};

use crate::error::RunnerResult;
use crate::records::{Report, Run, RunStatus};
use crate::store::{Filter, Store, StoreExt};
use crate::tasks::TaskPayload;

/// Stores a snapshot of the pool's counters.
pub struct ReportHandler {
    pool: Weak<WorkerPool<TaskPayload>>,
    registry: SandboxRegistry,
    store: Arc<dyn Store>,
}

impl ReportHandler {
    /// The pool owns its handlers, so it is held weakly here.
    pub fn new(pool: Weak<WorkerPool<TaskPayload>>, registry: SandboxRegistry, store: Arc<dyn Store>) -> Self {
        Self { pool, registry, store }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for ReportHandler {
    async fn handle(&self, task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        let Some(pool) = self.pool.upgrade() else {
            return Err(HandlerError::permanent("worker pool is gone"));
        };
        let report = Report {
            id: task.id.to_string(),
            stats: pool.stats(),
            sandboxes: self.registry.list().len(),
            created_at: Utc::now(),
        };
        info!(
            queue_length = report.stats.queue_length,
            processed = report.stats.total_processed,
            failed = report.stats.total_failed,
            retried = report.stats.total_retried,
            sandboxes = report.sandboxes,
            "queue report"
        );
        self.store
            .upsert_record(&report)
            .await
            .map_err(|e| HandlerError::retryable(format!("store: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// A pending or running run this old without a live sandbox is abandoned.
    pub stale_run_after: Duration,
    pub checkpoint_retention: Duration,
    /// How long a finished sandbox may linger before it is cleaned up.
    pub sandbox_grace: Duration,
}

/// What one sweep removed or settled.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub abandoned_runs: Vec<String>,
    pub pruned_checkpoints: Vec<String>,
    pub cleaned_sandboxes: Vec<String>,
    pub orphaned_resources: Vec<String>,
    pub orphaned_directories: usize,
}

impl SweepSummary {
    pub fn is_empty(&self) -> bool {
        self.abandoned_runs.is_empty()
            && self.pruned_checkpoints.is_empty()
            && self.cleaned_sandboxes.is_empty()
            && self.orphaned_resources.is_empty()
            && self.orphaned_directories == 0
    }
}

fn ago(duration: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Settles what crashed or forgotten work leaves behind.
pub struct Sweeper {
    registry: SandboxRegistry,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<dyn Store>,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        registry: SandboxRegistry,
        checkpoints: Arc<CheckpointStore>,
        store: Arc<dyn Store>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            store,
            settings,
        }
    }

    pub async fn sweep(&self) -> RunnerResult<SweepSummary> {
        let mut summary = SweepSummary {
            abandoned_runs: self.abandon_stale_runs().await?,
            pruned_checkpoints: self
                .checkpoints
                .prune_terminal(ago(self.settings.checkpoint_retention))
                .await?,
            cleaned_sandboxes: self.clean_finished_sandboxes().await,
            ..SweepSummary::default()
        };

        let orphans = self.registry.sweep_orphans().await?;
        summary.orphaned_resources = orphans.resources;
        summary.orphaned_directories = orphans.directories.len();

        if summary.is_empty() {
            debug!("stale sweep found nothing");
        } else {
            info!(
                abandoned_runs = summary.abandoned_runs.len(),
                pruned_checkpoints = summary.pruned_checkpoints.len(),
                cleaned_sandboxes = summary.cleaned_sandboxes.len(),
                orphaned_resources = summary.orphaned_resources.len(),
                orphaned_directories = summary.orphaned_directories,
                "stale sweep finished"
            );
        }
        Ok(summary)
    }

    async fn abandon_stale_runs(&self) -> RunnerResult<Vec<String>> {
        let cutoff = ago(self.settings.stale_run_after);
        let mut abandoned = Vec::new();
        for status in [RunStatus::Pending, RunStatus::Running] {
            let filter = Filter::new().field("status", serde_json::to_value(status).unwrap_or_default());
            let runs: Vec<Run> = self.store.search_records(&filter).await?;
            for mut run in runs {
                let last_seen = run.started_at.unwrap_or(run.created_at);
                if last_seen > cutoff {
                    continue;
                }
                let sandbox = run.sandbox.clone().unwrap_or_else(|| format!("action-{}", run.id));
                if self.registry.get(&sandbox).is_ok() {
                    continue;
                }
                warn!(run_id = %run.id, action_id = %run.action_id, "marking abandoned run");
                run.finish(RunStatus::Error, Some("abandoned".into()));
                self.store.update_record(&run).await?;
                abandoned.push(run.id);
            }
        }
        Ok(abandoned)
    }

    async fn clean_finished_sandboxes(&self) -> Vec<String> {
        let cutoff = ago(self.settings.sandbox_grace);
        let mut cleaned = Vec::new();
        for sandbox in self.registry.list() {
            let status = sandbox.status();
            if !status.state.is_terminal() {
                continue;
            }
            let finished_at = status.start_time.map(|start| {
                let ran = status
                    .duration
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_default();
                start + ran
            });
            // Never started: nothing to wait for.
            if finished_at.is_none_or(|at| at <= cutoff) {
                sandbox.cleanup().await;
                cleaned.push(status.name);
            }
        }
        cleaned
    }
}

pub struct StaleSweepHandler {
    sweeper: Arc<Sweeper>,
}

impl StaleSweepHandler {
    pub fn new(sweeper: Arc<Sweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for StaleSweepHandler {
    async fn handle(&self, _task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        self.sweeper
            .sweep()
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::retryable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use sandbox::{RegistryConfig, SandboxConfig};
    use sandbox_host::ProcessHost;
    use task_queue::{PoolConfig, TaskQueue};

    use crate::records::Action;
    use crate::store::MemoryStore;
    use crate::tasks::TaskRequest;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: SandboxRegistry,
        checkpoints: Arc<CheckpointStore>,
        store: Arc<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path().join("host-state")).unwrap();
        let mut config = RegistryConfig::new(dir.path().join("sandboxes"));
        config.stop_grace = Duration::from_secs(1);
        config.poll_interval = Duration::from_millis(50);
        Fixture {
            registry: SandboxRegistry::new(Arc::new(host), config),
            checkpoints: Arc::new(CheckpointStore::open(dir.path().join("checkpoints")).await.unwrap()),
            store: Arc::new(MemoryStore::new()),
            _dir: dir,
        }
    }

    fn sweeper(f: &Fixture, settings: SweepSettings) -> Sweeper {
        Sweeper::new(f.registry.clone(), Arc::clone(&f.checkpoints), f.store.clone(), settings)
    }

    fn run(id: &str, status: RunStatus, age: Duration) -> Run {
        let action = Action {
            id: "build".into(),
            repo_id: "app".into(),
            name: "Build".into(),
            script: "make".into(),
            timeout_secs: None,
            artifacts: Vec::new(),
            last_status: None,
            last_run_id: None,
            updated_at: None,
        };
        let mut run = Run::pending(id.into(), &action);
        run.status = status;
        run.created_at = ago(age);
        run
    }

    #[tokio::test]
    async fn old_runs_without_a_sandbox_are_abandoned() {
        let f = fixture().await;
        let hour = Duration::from_secs(3600);
        f.store.insert_record(&run("old", RunStatus::Running, 3 * hour)).await.unwrap();
        f.store.insert_record(&run("fresh", RunStatus::Running, Duration::ZERO)).await.unwrap();
        f.store.insert_record(&run("done", RunStatus::Success, 3 * hour)).await.unwrap();
        f.store.insert_record(&run("live", RunStatus::Running, 3 * hour)).await.unwrap();
        let live = f.registry.create(SandboxConfig::new("action-live")).await.unwrap();
        live.start().await.unwrap();

        let summary = sweeper(
            &f,
            SweepSettings {
                stale_run_after: hour,
                checkpoint_retention: hour,
                sandbox_grace: hour,
            },
        )
        .sweep()
        .await
        .unwrap();

        assert_eq!(summary.abandoned_runs, vec!["old".to_string()]);
        let old: Run = f.store.get_record("old").await.unwrap().unwrap();
        assert_eq!(old.status, RunStatus::Error);
        assert_eq!(old.reason.as_deref(), Some("abandoned"));
        let live_run: Run = f.store.get_record("live").await.unwrap().unwrap();
        assert_eq!(live_run.status, RunStatus::Running);

        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn finished_sandboxes_past_grace_are_cleaned() {
        let f = fixture().await;
        let done = f
            .registry
            .create(SandboxConfig::new("done").with_command("true"))
            .await
            .unwrap();
        done.start().await.unwrap();
        done.wait_for_completion(&tokio_util::sync::CancellationToken::new()).await;
        let idle = f.registry.create(SandboxConfig::new("idle")).await.unwrap();
        idle.start().await.unwrap();

        let summary = sweeper(
            &f,
            SweepSettings {
                stale_run_after: Duration::from_secs(3600),
                checkpoint_retention: Duration::from_secs(3600),
                sandbox_grace: Duration::ZERO,
            },
        )
        .sweep()
        .await
        .unwrap();

        assert_eq!(summary.cleaned_sandboxes, vec!["done".to_string()]);
        assert!(done.is_removed());
        assert!(f.registry.get("idle").is_ok());

        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn report_records_pool_stats() {
        let f = fixture().await;
        let pool = Arc::new(WorkerPool::new(Arc::new(TaskQueue::new(None)), PoolConfig::default()));
        let handler = ReportHandler::new(Arc::downgrade(&pool), f.registry.clone(), f.store.clone());
        let task = TaskRequest::new(TaskPayload::Report).into_task().unwrap();

        handler.handle(&task).await.unwrap();

        let report: Report = f.store.get_record(task.id.as_str()).await.unwrap().unwrap();
        assert_eq!(report.stats.worker_count, pool.worker_count());
        assert_eq!(report.sandboxes, 0);

        drop(pool);
        assert!(!handler.handle(&task).await.unwrap_err().is_retryable());
    }
}
