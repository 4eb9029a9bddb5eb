//! Wires the queue, workers, scheduler, sandboxes and stores into one engine
//! and runs the serve loop.

use std::sync::Arc;

use async_trait::async_trait;
use checkpoint::CheckpointStore;
use sandbox::{Host, RegistryConfig, SandboxRegistry};
use sandbox_host::{DockerHost, ProcessHost};
use task_queue::{DeadLetter, DeadLetterSink, PoolConfig, Scheduler, Task, TaskId, TaskQueue, WorkerPool};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::agent::{AgentSessionHandler, AgentSettings};
use crate::config::{Backend, EngineConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::executor::{ActionHandler, ExecutorConfig, JobExecutor};
use crate::handlers::{CommandModelClient, ModelClient, NoModel, ReviewHandler, TriageHandler};
use crate::maintenance::{ReportHandler, StaleSweepHandler, SweepSettings, Sweeper};
use crate::paths::EnginePaths;
use crate::records::DeadLetterRecord;
use crate::repo::{DirRepositories, Repositories};
use crate::spool::Spool;
use crate::status::{EngineMode, StatusTracker};
use crate::store::{FileStore, Store, StoreExt};
use crate::tasks::{TaskKind, TaskPayload, TaskRequest};

/// Check the configured backend's prerequisites and build it.
pub async fn host_from_config(config: &EngineConfig) -> RunnerResult<Arc<dyn Host>> {
    let paths = EnginePaths::new(config.base_dir.clone());
    match config.sandbox.backend {
        Backend::Process => {
            sandbox_host::check_process_host(&paths.host_state()).await?;
            Ok(Arc::new(ProcessHost::new(paths.host_state())?))
        }
        Backend::Docker => {
            sandbox_host::check_docker(&config.sandbox.docker).await?;
            Ok(Arc::new(DockerHost::new(config.sandbox.docker.clone())))
        }
    }
}

/// The configured model command, or [`NoModel`] when there is none.
pub fn model_from_config(config: &EngineConfig) -> RunnerResult<Arc<dyn ModelClient>> {
    if config.ai.command.is_empty() {
        return Ok(Arc::new(NoModel));
    }
    let client = CommandModelClient::new(&config.ai.command, config.ai.timeout())
        .map_err(|e| RunnerError::Config(format!("ai.command: {e}")))?;
    Ok(Arc::new(client))
}

pub fn registry_config(config: &EngineConfig) -> RegistryConfig {
    let paths = EnginePaths::new(config.base_dir.clone());
    let mut registry = RegistryConfig::new(paths.sandboxes());
    registry.resource_prefix = config.sandbox.resource_prefix.clone();
    registry.stop_grace = config.sandbox.stop_grace();
    registry.poll_interval = config.sandbox.poll_interval();
    registry
}

pub fn sweep_settings(config: &EngineConfig) -> SweepSettings {
    SweepSettings {
        stale_run_after: config.maintenance.stale_run_after(),
        checkpoint_retention: config.checkpoints.retention(),
        sandbox_grace: config.actions.cleanup_grace().max(config.agent.cleanup_grace()),
    }
}

/// Persists dead letters as `dead_letters` records.
struct StoreDeadLetterSink {
    store: Arc<dyn Store>,
}

#[async_trait]
impl DeadLetterSink<TaskPayload> for StoreDeadLetterSink {
    async fn record(
        &self,
        letter: &DeadLetter<TaskPayload>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let task = &letter.task;
        let record = DeadLetterRecord {
            id: task.id.to_string(),
            kind: task.kind().to_string(),
            payload: serde_json::to_value(&task.payload)?,
            error: letter.error.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            origin: task.origin.clone(),
            failed_at: letter.failed_at,
        };
        self.store.upsert_record(&record).await?;
        Ok(())
    }
}

pub struct Engine {
    config: EngineConfig,
    paths: EnginePaths,
    queue: Arc<TaskQueue<TaskPayload>>,
    pool: Arc<WorkerPool<TaskPayload>>,
    scheduler: Scheduler<TaskPayload>,
    registry: SandboxRegistry,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<dyn Store>,
    spool: Spool,
    status: Arc<StatusTracker>,
    shutdown: CancellationToken,
    background: TaskTracker,
}

impl Engine {
    /// Build every component and register the handlers. Nothing runs until
    /// [`start`](Self::start).
    pub async fn build(
        config: EngineConfig,
        host: Arc<dyn Host>,
        model: Arc<dyn ModelClient>,
    ) -> RunnerResult<Self> {
        config.validate()?;
        let paths = EnginePaths::new(config.base_dir.clone());
        for dir in paths.all_dirs() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| RunnerError::Config(format!("create {}: {e}", dir.display())))?;
        }

        let store: Arc<dyn Store> = Arc::new(FileStore::open(paths.store()).await?);
        let checkpoints = Arc::new(CheckpointStore::open(paths.checkpoints()).await?);
        let repos: Arc<dyn Repositories> = Arc::new(DirRepositories::new(config.repositories.root.clone()));
        let registry = SandboxRegistry::new(host, registry_config(&config));
        let shutdown = CancellationToken::new();
        let background = TaskTracker::new();

        let queue = Arc::new(TaskQueue::new(config.queue_capacity()));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            PoolConfig {
                workers: config.queue.workers,
                demotion: config.queue.demotion,
                retry_backoff: config.queue.retry_backoff,
                dead_letter_capacity: config.queue.dead_letter_capacity,
            },
        ));
        pool.set_dead_letter_sink(Arc::new(StoreDeadLetterSink {
            store: Arc::clone(&store),
        }));

        pool.register(
            TaskKind::IssueTriage,
            Arc::new(TriageHandler::new(Arc::clone(&model), Arc::clone(&store))),
        );
        pool.register(
            TaskKind::PrReview,
            Arc::new(ReviewHandler::new(model, Arc::clone(&store), Arc::clone(&repos))),
        );
        let executor = JobExecutor::new(
            registry.clone(),
            Arc::clone(&store),
            Arc::clone(&repos),
            ExecutorConfig {
                default_timeout: config.actions.default_timeout(),
                artifact_max_bytes: config.actions.artifact_max_bytes,
                artifacts_dir: paths.artifacts(),
                cleanup_grace: config.actions.cleanup_grace(),
            },
            shutdown.clone(),
        );
        pool.register(TaskKind::ActionRun, Arc::new(ActionHandler::new(Arc::new(executor))));
        pool.register(
            TaskKind::AgentSession,
            Arc::new(AgentSessionHandler::new(
                registry.clone(),
                repos,
                Arc::clone(&checkpoints),
                Arc::clone(&store),
                AgentSettings {
                    command_timeout: config.agent.command_timeout(),
                    cleanup_grace: config.agent.cleanup_grace(),
                    completed_grace: config.checkpoints.completed_grace(),
                },
                shutdown.clone(),
                background.clone(),
            )),
        );
        pool.register(
            TaskKind::Report,
            Arc::new(ReportHandler::new(Arc::downgrade(&pool), registry.clone(), Arc::clone(&store))),
        );
        let sweeper = Sweeper::new(
            registry.clone(),
            Arc::clone(&checkpoints),
            Arc::clone(&store),
            sweep_settings(&config),
        );
        pool.register(TaskKind::StaleSweep, Arc::new(StaleSweepHandler::new(Arc::new(sweeper))));

        let spool = Spool::open(&paths).await?;
        let status = Arc::new(StatusTracker::new(paths.status()));
        let scheduler = Scheduler::new(Arc::clone(&queue));

        Ok(Self {
            config,
            paths,
            queue,
            pool,
            scheduler,
            registry,
            checkpoints,
            store,
            spool,
            status,
            shutdown,
            background,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    pub fn queue(&self) -> &Arc<TaskQueue<TaskPayload>> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool<TaskPayload>> {
        &self.pool
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Clear leftovers of a previous process, then start the workers and
    /// the periodic jobs.
    pub async fn start(&self) -> RunnerResult<()> {
        if let Err(e) = self.registry.sweep_orphans().await {
            warn!(error = %e, "orphan sweep failed");
        }
        match self.checkpoints.remove_temp_files().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed partial checkpoint writes"),
            Err(e) => warn!(error = %e, "failed to remove partial checkpoint writes"),
        }

        self.pool.start();
        self.scheduler
            .every("report", self.config.maintenance.report_interval(), || {
                Task::new(TaskPayload::Report)
            });
        self.scheduler
            .every("stale_sweep", self.config.maintenance.stale_sweep_interval(), || {
                Task::new(TaskPayload::StaleSweep)
            });
        self.status.write_initial().await;
        info!(
            base_dir = %self.paths.base_dir().display(),
            workers = self.config.queue.workers,
            backend = ?self.config.sandbox.backend,
            "engine started"
        );
        Ok(())
    }

    /// Validate and enqueue a request from an in-process producer.
    pub fn submit(&self, request: TaskRequest) -> RunnerResult<TaskId> {
        let task = request.into_task().map_err(RunnerError::InvalidRequest)?;
        Ok(self.queue.enqueue(task)?)
    }

    async fn refresh_status(&self) {
        let sandboxes: Vec<_> = self.registry.list().iter().map(|s| s.status()).collect();
        self.status.update(self.pool.stats(), &sandboxes).await;
    }

    async fn poll_spool(&self) {
        match self.spool.drain(&self.queue).await {
            Ok(report) => {
                if !report.enqueued.is_empty() || !report.rejected.is_empty() {
                    info!(
                        enqueued = report.enqueued.len(),
                        rejected = report.rejected.len(),
                        deferred = report.deferred,
                        "spool drained"
                    );
                }
            }
            Err(e) => error!(error = %e, "failed to drain spool"),
        }
    }

    /// Take spooled work until `mode` leaves `Running`, then drain or stop.
    pub async fn serve(&self, mut mode: watch::Receiver<EngineMode>) -> RunnerResult<()> {
        let poll = self.config.spool.poll_interval();
        let mut current = EngineMode::Running;

        loop {
            let next = *mode.borrow_and_update();
            if next != current {
                current = next;
                self.status.set_mode(current).await;
            }
            if current != EngineMode::Running {
                break;
            }

            self.poll_spool().await;
            self.refresh_status().await;

            tokio::select! {
                changed = mode.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can ask for a drain any more.
                        current = EngineMode::Stopping;
                        self.status.set_mode(current).await;
                        break;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        if current == EngineMode::Draining {
            info!(queued = self.queue.len(), "draining: no new intake, finishing queued tasks");
            self.scheduler.shutdown().await;
            let idle = CancellationToken::new();
            let wait = self.pool.wait_idle(&idle);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    changed = mode.changed() => {
                        if changed.is_err() || *mode.borrow_and_update() == EngineMode::Stopping {
                            info!("stop requested while draining");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll) => self.refresh_status().await,
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop everything. In-flight handlers observe cancellation, record what
    /// they were doing and return; sandboxes are stopped but kept on disk for
    /// the next orphan sweep.
    pub async fn shutdown(&self) {
        self.status.set_mode(EngineMode::Stopping).await;
        self.scheduler.shutdown().await;
        self.queue.close();
        self.shutdown.cancel();
        self.pool.shutdown().await;
        self.background.close();
        self.background.wait().await;
        self.registry.shutdown().await;
        self.refresh_status().await;
        self.status.set_mode(EngineMode::Stopped).await;
        info!(stats = ?self.pool.stats(), "engine stopped");
    }
}

/// Mode changes driven by signals: SIGTERM and SIGINT stop, SIGUSR1 drains.
/// A second signal while draining stops.
pub fn signal_modes() -> watch::Receiver<EngineMode> {
    let (tx, rx) = watch::channel(EngineMode::Running);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigusr1 = signal(SignalKind::user_defined1()).ok();

        loop {
            let next = tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, stopping");
                    EngineMode::Stopping
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, stopping");
                    EngineMode::Stopping
                }
                _ = recv_signal(&mut sigusr1) => {
                    info!("received SIGUSR1, draining");
                    EngineMode::Draining
                }
            };
            let stop = next == EngineMode::Stopping || *tx.borrow() == EngineMode::Draining;
            let mode = if stop { EngineMode::Stopping } else { next };
            if tx.send(mode).is_err() || mode == EngineMode::Stopping {
                break;
            }
        }
    });
    rx
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::records::{DeadLetterRecord, Report};
    use crate::store::Filter;
    use crate::tasks::IssueTriage;

    use super::*;

    async fn engine(dir: &std::path::Path) -> Engine {
        let mut config = EngineConfig::new(dir.to_path_buf());
        config.queue.retry_backoff = None;
        config.spool.poll_interval_ms = 20;
        config.sandbox.poll_interval_ms = 50;
        config.sandbox.stop_grace_secs = 1;
        let host = host_from_config(&config).await.unwrap();
        Engine::build(config, host, Arc::new(NoModel)).await.unwrap()
    }

    fn triage(number: u64) -> TaskRequest {
        TaskRequest::new(TaskPayload::IssueTriage(IssueTriage {
            repo_id: "app".into(),
            issue_number: number,
            title: "Crash".into(),
            body: String::new(),
        }))
    }

    #[tokio::test]
    async fn permanent_failures_become_dead_letter_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.start().await.unwrap();

        let id = engine.submit(triage(7)).unwrap();
        engine.pool().wait_idle(&CancellationToken::new()).await;

        let letter: DeadLetterRecord = engine.store().get_record(id.as_str()).await.unwrap().unwrap();
        assert_eq!(letter.kind, "issue_triage");
        assert_eq!(letter.error, "no model provider configured");
        assert_eq!(letter.payload["payload"]["issue_number"], 7);
        assert_eq!(engine.pool().stats().total_failed, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn serve_takes_spooled_tasks_and_drains_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.start().await.unwrap();

        let mut report = TaskRequest::new(TaskPayload::Report);
        report.id = Some(TaskId::new("report-spooled"));
        engine.spool().submit(&report).await.unwrap();

        let (tx, rx) = watch::channel(EngineMode::Running);
        let serve = engine.serve(rx);
        let control = async {
            for _ in 0..200 {
                let reports: Vec<Report> = engine.store().search_records(&Filter::new()).await.unwrap();
                if !reports.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tx.send(EngineMode::Draining).unwrap();
        };
        let (result, ()) = tokio::join!(serve, control);
        result.unwrap();

        let stored: Option<Report> = engine.store().get_record("report-spooled").await.unwrap();
        assert!(stored.is_some());
        let status = crate::status::read(&engine.paths().status()).await.unwrap();
        assert_eq!(status.mode, EngineMode::Stopped);
        assert!(engine.queue().is_closed());
    }
}
