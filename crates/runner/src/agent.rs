//! Agent sessions: a sequence of commands in an idle sandbox on a copy of the
//! repository, checkpointed after every command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::{CheckpointStore, OperationError, OperationHandle, ResumableOperation};
use chrono::Utc;
use retry::Context;
use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxRegistry, SandboxState, SourceMount};
use serde_json::{Map, json};
use task_queue::{HandlerError, Task, TaskHandler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::executor::{sandbox_failure, tail};
use crate::handlers::repo_failure;
use crate::records::{SessionRecord, SessionStatus};
use crate::repo::{Repositories, classify_git_failure};
use crate::store::{Store, StoreExt};
use crate::tasks::{AgentSession, PushTarget, TaskPayload};

/// Per-step output kept in the checkpoint state.
const STEP_OUTPUT_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command_timeout: Duration,
    pub cleanup_grace: Duration,
    /// How long a completed session checkpoint is kept.
    pub completed_grace: Duration,
}

pub struct AgentSessionHandler {
    registry: SandboxRegistry,
    repos: Arc<dyn Repositories>,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<dyn Store>,
    settings: AgentSettings,
    shutdown: CancellationToken,
    background: TaskTracker,
}

/// Single-quote for bash.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn push_command(push: &PushTarget) -> String {
    format!(
        "git push --porcelain {} {}",
        shell_quote(&push.remote),
        shell_quote(&format!("HEAD:refs/heads/{}", push.branch))
    )
}

fn exec_failure(err: SandboxError) -> OperationError {
    match err {
        SandboxError::ExecTimeout(_) => OperationError::permanent(err.to_string()),
        _ => OperationError::retryable(err.to_string()),
    }
}

impl AgentSessionHandler {
    pub fn new(
        registry: SandboxRegistry,
        repos: Arc<dyn Repositories>,
        checkpoints: Arc<CheckpointStore>,
        store: Arc<dyn Store>,
        settings: AgentSettings,
        shutdown: CancellationToken,
        background: TaskTracker,
    ) -> Self {
        Self {
            registry,
            repos,
            checkpoints,
            store,
            settings,
            shutdown,
            background,
        }
    }

    /// A running sandbox for the session, reusing one left by an earlier
    /// attempt when it is still running.
    async fn sandbox(&self, session: &AgentSession) -> Result<Arc<Sandbox>, HandlerError> {
        let repo = self.repos.path(&session.repo_id).await.map_err(repo_failure)?;
        let config = SandboxConfig::new(format!("agent-{}", session.session_id))
            .with_source(SourceMount::Copy(repo))
            .with_label(format!("agent session {}", session.session_id))
            .with_env("SESSION_ID", &session.session_id)
            .with_env("REPO_ID", &session.repo_id);

        let mut sandbox = self.registry.create(config.clone()).await.map_err(sandbox_failure)?;
        if sandbox.refresh().await.is_terminal() {
            sandbox.cleanup().await;
            sandbox = self.registry.create(config).await.map_err(sandbox_failure)?;
        }
        if sandbox.state() == SandboxState::Created {
            sandbox.start().await.map_err(sandbox_failure)?;
        }
        Ok(sandbox)
    }

    async fn run_steps(
        &self,
        handle: OperationHandle,
        session: &AgentSession,
        sandbox: &Sandbox,
    ) -> Result<(), OperationError> {
        let total = handle.total_steps();
        loop {
            let step = handle.current_step().await;
            if step >= total {
                return Ok(());
            }
            handle.context().check()?;

            let index = usize::try_from(step).unwrap_or(usize::MAX);
            let command = match session.commands.get(index) {
                Some(command) => command.clone(),
                None => match &session.push {
                    Some(push) => push_command(push),
                    None => return Err(OperationError::InvalidStep { step, total }),
                },
            };
            let is_push = index >= session.commands.len();

            info!(session_id = %session.session_id, step, total, "running session step");
            let result = sandbox
                .execute_with_timeout(&command, self.settings.command_timeout)
                .await
                .map_err(exec_failure)?;

            let mut record = Map::new();
            record.insert(
                format!("step_{step}"),
                json!({
                    "command": command,
                    "exit_code": result.exit_code,
                    "output": tail(&result.output, STEP_OUTPUT_BYTES),
                }),
            );
            handle.save_state(record).await?;

            if !result.success() {
                if is_push {
                    let failure = classify_git_failure(&result.output);
                    let message = format!("push failed ({failure:?}): {}", result.output.trim());
                    return Err(if failure.is_retryable() {
                        OperationError::retryable(message)
                    } else {
                        OperationError::permanent(message)
                    });
                }
                return Err(OperationError::permanent(format!(
                    "step {} exited with {}",
                    step + 1,
                    result.exit_code
                )));
            }
            handle.next_step().await?;
        }
    }

    async fn record(
        &self,
        session: &AgentSession,
        status: SessionStatus,
        steps_completed: u32,
        error: Option<String>,
    ) {
        let record = SessionRecord {
            id: session.session_id.clone(),
            repo_id: session.repo_id.clone(),
            status,
            steps_completed,
            total_steps: session.total_steps(),
            error,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_record(&record).await {
            warn!(session_id = %session.session_id, error = %e, "failed to record session");
        }
    }

    /// Stop now and remove after the grace period.
    async fn retire(&self, sandbox: &Sandbox) {
        sandbox.stop().await;
        if let Err(e) = self.registry.schedule_cleanup(sandbox.name(), self.settings.cleanup_grace) {
            warn!(sandbox = %sandbox.name(), error = %e, "failed to schedule sandbox cleanup");
        }
    }
}

#[async_trait]
impl TaskHandler<TaskPayload> for AgentSessionHandler {
    async fn handle(&self, task: &Task<TaskPayload>) -> Result<(), HandlerError> {
        let TaskPayload::AgentSession(session) = &task.payload else {
            return Err(HandlerError::permanent(format!("unexpected payload for agent session: {}", task.kind())));
        };

        let sandbox = self.sandbox(session).await?;
        self.record(session, SessionStatus::Running, 0, None).await;

        let operation = ResumableOperation::new(
            format!("agent-{}", session.session_id),
            session.total_steps(),
            Arc::clone(&self.checkpoints),
        )
        .with_completed_grace(self.settings.completed_grace)
        .with_background(self.shutdown.clone(), self.background.clone());
        let ctx = Context::new(self.shutdown.child_token());

        let result = operation
            .run(&ctx, |handle| self.run_steps(handle, session, &sandbox))
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    session_id = %session.session_id,
                    steps = outcome.step,
                    resumed = ?outcome.started_as,
                    "agent session completed"
                );
                self.record(session, SessionStatus::Completed, outcome.step, None).await;
                self.retire(&sandbox).await;
                Ok(())
            }
            Err(err) => {
                let step = self
                    .checkpoints
                    .load(operation.id())
                    .await
                    .map(|checkpoint| checkpoint.step)
                    .unwrap_or(0);
                self.record(session, SessionStatus::Failed, step, Some(err.to_string())).await;

                let will_retry = err.is_retryable() && task.retry_count.saturating_add(1) < task.max_retries;
                if will_retry {
                    // The next attempt continues in the same workspace.
                    Err(HandlerError::retryable(err.to_string()))
                } else {
                    self.retire(&sandbox).await;
                    Err(if err.is_retryable() {
                        HandlerError::retryable(err.to_string())
                    } else {
                        HandlerError::permanent(err.to_string())
                    })
                }
            }
        }
    }
}
