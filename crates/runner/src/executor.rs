//! Runs CI actions in throwaway sandboxes and records the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sandbox::{Artifact, Sandbox, SandboxConfig, SandboxError, SandboxRegistry, SandboxState, SourceMount};
use sha2::{Digest, Sha256};
use task_queue::{HandlerError, Task, TaskHandler, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::handlers::repo_failure;
use crate::records::{Action, ArtifactRecord, Run, RunStatus};
use crate::repo::Repositories;
use crate::store::{Store, StoreError, StoreExt, StoreResult};
use crate::tasks::{ActionRun, TaskPayload};

/// Run records keep this much of the end of the output.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub artifact_max_bytes: u64,
    pub artifacts_dir: PathBuf,
    pub cleanup_grace: Duration,
}

pub struct JobExecutor {
    registry: SandboxRegistry,
    store: Arc<dyn Store>,
    repos: Arc<dyn Repositories>,
    config: ExecutorConfig,
    shutdown: CancellationToken,
}

fn store_failure(err: StoreError) -> HandlerError {
    HandlerError::retryable(format!("store: {err}"))
}

pub(crate) fn sandbox_failure(err: SandboxError) -> HandlerError {
    match err {
        SandboxError::InvalidConfig(_) => HandlerError::permanent(err.to_string()),
        _ => HandlerError::retryable(err.to_string()),
    }
}

/// Last `max` bytes, starting at a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text.get(start..).unwrap_or_default()
}

impl JobExecutor {
    pub fn new(
        registry: SandboxRegistry,
        store: Arc<dyn Store>,
        repos: Arc<dyn Repositories>,
        config: ExecutorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            repos,
            config,
            shutdown,
        }
    }

    /// Execute one action and return its finished run.
    ///
    /// A failing script is a successful execution with a `failure` run. Errors
    /// are reserved for the engine not being able to run the job; the run is
    /// then recorded with status `error`.
    pub async fn run(&self, task_id: &TaskId, job: &ActionRun) -> Result<Run, HandlerError> {
        let action: Action = self
            .store
            .get_record(&job.action_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| HandlerError::permanent(format!("action not found: {}", job.action_id)))?;

        let mut run = Run::pending(Uuid::new_v4().to_string(), &action);
        run.task_id = Some(task_id.to_string());
        run.commit = job.commit.clone();
        self.store.insert_record(&run).await.map_err(store_failure)?;
        info!(run_id = %run.id, action_id = %action.id, task_id = %task_id, "run created");

        let repo = match self.repos.path(&action.repo_id).await {
            Ok(repo) => repo,
            Err(e) => {
                let err = repo_failure(e);
                self.abort(&mut run, err.to_string()).await;
                return Err(err);
            }
        };

        let timeout = action
            .timeout_secs
            .map_or(self.config.default_timeout, Duration::from_secs);
        let name = format!("action-{}", run.id);
        let mut config = SandboxConfig::new(&name)
            .with_source(SourceMount::Bind {
                path: repo,
                read_only: true,
            })
            .with_label(format!("{} ({})", action.name, action.id))
            .with_command(&action.script)
            .with_timeout(timeout)
            .with_env("RUN_ID", &run.id)
            .with_env("ACTION_ID", &action.id)
            .with_env("REPO_ID", &action.repo_id);
        if let Some(commit) = &job.commit {
            config = config.with_env("COMMIT", commit);
        }

        let sandbox = match self.registry.create(config).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "sandbox creation failed");
                let err = sandbox_failure(e);
                self.abort(&mut run, err.to_string()).await;
                return Err(err);
            }
        };
        if let Err(e) = sandbox.start().await {
            error!(run_id = %run.id, sandbox = %name, error = %e, "sandbox start failed");
            let err = sandbox_failure(e);
            self.abort(&mut run, err.to_string()).await;
            sandbox.cleanup().await;
            return Err(err);
        }

        run.status = RunStatus::Running;
        run.sandbox = Some(name.clone());
        run.started_at = Some(Utc::now());
        if let Err(e) = self.store.update_record(&run).await {
            warn!(run_id = %run.id, error = %e, "failed to mark run running");
        }
        self.record_on_action(&action.id, &run).await;
        info!(run_id = %run.id, sandbox = %name, timeout_secs = timeout.as_secs(), "run started");

        let state = sandbox.wait_for_completion(&self.shutdown).await;
        if !state.is_terminal() {
            sandbox.stop().await;
            self.abort(&mut run, "interrupted by engine shutdown".into()).await;
            return Err(HandlerError::retryable("interrupted by engine shutdown"));
        }

        let status = sandbox.status();
        let (run_status, reason) = if status.timed_out {
            (RunStatus::TimedOut, Some(format!("timed out after {}s", timeout.as_secs())))
        } else {
            match state {
                SandboxState::Completed => (RunStatus::Success, None),
                SandboxState::Failed => (
                    RunStatus::Failure,
                    status.exit_code.map(|code| format!("exit code {code}")),
                ),
                _ => (RunStatus::Failure, Some(format!("sandbox {state}"))),
            }
        };
        run.exit_code = status.exit_code;
        match sandbox.output().await {
            Ok(output) => run.output = tail(&output, OUTPUT_TAIL_BYTES).to_string(),
            Err(e) => warn!(run_id = %run.id, error = %e, "failed to read run output"),
        }

        if !action.artifacts.is_empty() {
            self.keep_artifacts(&sandbox, &run.id, &action.artifacts).await;
        }

        run.finish(run_status, reason);
        if let Err(e) = self.store.update_record(&run).await {
            warn!(run_id = %run.id, error = %e, "failed to record finished run");
        }
        self.record_on_action(&action.id, &run).await;
        info!(
            run_id = %run.id,
            status = ?run.status,
            exit_code = ?run.exit_code,
            "run finished"
        );

        if let Err(e) = self.registry.schedule_cleanup(&name, self.config.cleanup_grace) {
            warn!(sandbox = %name, error = %e, "failed to schedule sandbox cleanup");
        }
        Ok(run)
    }

    /// Mark the run as not executed.
    async fn abort(&self, run: &mut Run, reason: String) {
        run.finish(RunStatus::Error, Some(reason));
        if let Err(e) = self.store.update_record(&*run).await {
            warn!(run_id = %run.id, error = %e, "failed to record run error");
        }
        self.record_on_action(&run.action_id, run).await;
    }

    /// Keep the action's last status and run id in step with its runs.
    async fn record_on_action(&self, action_id: &str, run: &Run) {
        let result: StoreResult<()> = async {
            let Some(mut action) = self.store.get_record::<Action>(action_id).await? else {
                return Ok(());
            };
            action.last_status = Some(run.status);
            action.last_run_id = Some(run.id.clone());
            action.updated_at = Some(Utc::now());
            self.store.update_record(&action).await
        }
        .await;
        if let Err(e) = result {
            warn!(action_id, run_id = %run.id, error = %e, "failed to update action status");
        }
    }

    async fn keep_artifacts(&self, sandbox: &Sandbox, run_id: &str, patterns: &[String]) {
        let found = match sandbox.extract_artifacts(patterns).await {
            Ok(found) => found,
            Err(e) => {
                warn!(run_id, error = %e, "artifact extraction failed");
                return;
            }
        };

        let dest_root = self.config.artifacts_dir.join(run_id);
        let mut kept = 0usize;
        for artifact in &found {
            if artifact.size > self.config.artifact_max_bytes {
                warn!(
                    run_id,
                    path = %artifact.relative_path.display(),
                    size = artifact.size,
                    max = self.config.artifact_max_bytes,
                    "artifact exceeds size cap, skipped"
                );
                continue;
            }
            match self.keep_artifact(&dest_root, run_id, artifact).await {
                Ok(()) => kept += 1,
                Err(e) => warn!(
                    run_id,
                    path = %artifact.relative_path.display(),
                    error = %e,
                    "failed to keep artifact"
                ),
            }
        }
        info!(run_id, found = found.len(), kept, "artifacts collected");
    }

    async fn keep_artifact(&self, dest_root: &Path, run_id: &str, artifact: &Artifact) -> StoreResult<()> {
        let bytes = tokio::fs::read(&artifact.path).await?;
        let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        if size > self.config.artifact_max_bytes {
            warn!(run_id, path = %artifact.relative_path.display(), size, "artifact grew past size cap, skipped");
            return Ok(());
        }
        let sha256 = format!("{:x}", Sha256::digest(&bytes));

        let dest = dest_root.join(&artifact.relative_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, &bytes).await?;

        self.store
            .insert_record(&ArtifactRecord {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.to_string(),
                path: artifact.relative_path.to_string_lossy().into_owned(),
                stored_at: dest.to_string_lossy().into_owned(),
                size,
                sha256,
                created_at: Utc::now(),
            })
            .await
    }
}

/// Dispatches `action_run` tasks to the executor.
pub struct ActionHandler {
    executor: Arc<JobExecutor>,
}

impl ActionHandler {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for ActionHandler {
    async fn handle(&self, task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        let TaskPayload::ActionRun(job) = &task.payload else {
            return Err(HandlerError::permanent(format!("unexpected payload for action run: {}", task.kind())));
        };
        self.executor.run(&task.id, job).await.map(|_| ())
    }
}
