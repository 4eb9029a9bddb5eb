use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::artifacts::{self, Artifact};
use crate::config::{SandboxConfig, SourceMount};
use crate::error::{Result, SandboxError};
use crate::host::Host;
use crate::paths::{SandboxPaths, strip_markers};
use crate::registry::RegistryInner;
use crate::types::{ExecRequest, ExecResult, LaunchSpec, Mount, SandboxState, SandboxStatus};

#[derive(Default)]
struct Timing {
    start_time: Option<DateTime<Utc>>,
    started: Option<Instant>,
    duration: Option<Duration>,
    exit_code: Option<i32>,
}

/// One named sandbox. Obtained from [`crate::SandboxRegistry::create`].
///
/// State only moves forward: created -> running -> completed | failed |
/// stopped. A finished sandbox is never started again; create a new one.
pub struct Sandbox {
    config: SandboxConfig,
    resource: String,
    paths: SandboxPaths,
    host: Arc<dyn Host>,
    state: AtomicU8,
    timed_out: AtomicBool,
    /// Set before the host is asked to stop, so an exit seen meanwhile
    /// settles as `stopped`.
    stopping: AtomicBool,
    removed: AtomicBool,
    timing: Mutex<Timing>,
    /// Cancels the watchdog. Child of the registry's shutdown token.
    watchdog: CancellationToken,
    /// Cancelled once the sandbox leaves `running`.
    finished: CancellationToken,
    tasks: TaskTracker,
    registry: Weak<RegistryInner>,
    stop_grace: Duration,
    poll_interval: Duration,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Sandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        paths: SandboxPaths,
        registry: &Arc<RegistryInner>,
    ) -> Self {
        let settings = registry.config();
        Self {
            resource: format!("{}{}", settings.resource_prefix, config.name),
            stop_grace: settings.stop_grace,
            poll_interval: settings.poll_interval,
            config,
            paths,
            host: Arc::clone(registry.host()),
            state: AtomicU8::new(SandboxState::Created as u8),
            timed_out: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            timing: Mutex::new(Timing::default()),
            watchdog: registry.shutdown_token().child_token(),
            finished: CancellationToken::new(),
            tasks: registry.tasks().clone(),
            registry: Arc::downgrade(registry),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host-side resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    /// Last known state, without asking the host.
    pub fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch_spec(&self) -> LaunchSpec {
        let mount = match &self.config.source {
            SourceMount::Bind { path, read_only } => Mount::Bind {
                path: path.clone(),
                read_only: *read_only,
            },
            SourceMount::None | SourceMount::Copy(_) => Mount::None,
        };
        LaunchSpec {
            resource: self.resource.clone(),
            label: self.config.label.clone(),
            root: self.paths.root().to_path_buf(),
            workspace: self.paths.workspace(),
            entrypoint: self.paths.entrypoint(),
            log: self.paths.log(),
            mount,
            env: self.config.env.clone(),
        }
    }

    /// Launch the entry script. Only a sandbox in `created` can be started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state();
        if state != SandboxState::Created {
            return Err(SandboxError::AlreadyStarted {
                name: self.config.name.clone(),
                state,
            });
        }

        if let Err(e) = self.host.launch(&self.launch_spec()).await {
            if self.transition(SandboxState::Created, SandboxState::Failed) {
                self.finish(None);
            }
            return Err(SandboxError::StartFailed(format!("{}: {e}", self.config.name)));
        }

        {
            let mut timing = self.timing();
            timing.start_time = Some(Utc::now());
            timing.started = Some(Instant::now());
        }
        self.transition(SandboxState::Created, SandboxState::Running);
        info!(
            sandbox = %self.config.name,
            host = self.host.name(),
            timeout_secs = self.config.timeout.as_secs(),
            "sandbox started"
        );

        if !self.config.timeout.is_zero() {
            self.spawn_watchdog();
        }
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let timeout = self.config.timeout;
        self.tasks.spawn(async move {
            tokio::select! {
                _ = this.watchdog.cancelled() => {}
                _ = this.finished.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if this.refresh().await == SandboxState::Running {
                        warn!(
                            sandbox = %this.config.name,
                            timeout_secs = timeout.as_secs(),
                            "sandbox exceeded its timeout, stopping"
                        );
                        this.halt(true).await;
                    }
                }
            }
        });
    }

    /// Record the end of the run. Called exactly once, by whoever wins the
    /// transition out of `running` (or `created`).
    fn finish(&self, exit_code: Option<i32>) {
        {
            let mut timing = self.timing();
            timing.duration = timing.started.map(|s| s.elapsed());
            timing.exit_code = exit_code;
        }
        self.finished.cancel();
    }

    /// Ask the host whether the entry script is still running and settle the
    /// state if it has exited.
    pub async fn refresh(&self) -> SandboxState {
        if self.state() != SandboxState::Running {
            return self.state();
        }
        match self.host.is_running(&self.resource).await {
            Ok(true) => {}
            Ok(false) => {
                let exit_code = match self.host.exit_code(&self.resource).await {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(sandbox = %self.config.name, error = %e, "failed to read exit code");
                        None
                    }
                };
                let to = if self.stopping.load(Ordering::Acquire) {
                    SandboxState::Stopped
                } else if exit_code == Some(0) {
                    SandboxState::Completed
                } else {
                    SandboxState::Failed
                };
                if self.transition(SandboxState::Running, to) {
                    self.finish(exit_code);
                    info!(sandbox = %self.config.name, state = %to, exit_code, "sandbox finished");
                }
            }
            Err(e) => warn!(sandbox = %self.config.name, error = %e, "failed to query host"),
        }
        self.state()
    }

    fn remaining(&self) -> Option<Duration> {
        if self.config.timeout.is_zero() {
            return None;
        }
        let started = self.timing().started?;
        Some(self.config.timeout.saturating_sub(started.elapsed()))
    }

    /// Run `cmd` in the workspace of a running sandbox. Output is stdout and
    /// stderr combined. Bounded by what is left of the sandbox timeout.
    pub async fn execute(&self, cmd: &str) -> Result<ExecResult> {
        self.execute_bounded(cmd, None).await
    }

    /// Like [`execute`](Self::execute), additionally bounded by `timeout`.
    pub async fn execute_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<ExecResult> {
        self.execute_bounded(cmd, Some(timeout)).await
    }

    async fn execute_bounded(&self, cmd: &str, limit: Option<Duration>) -> Result<ExecResult> {
        let state = self.refresh().await;
        if state != SandboxState::Running {
            return Err(SandboxError::NotRunning {
                name: self.config.name.clone(),
                state,
            });
        }

        let timeout = match (self.remaining(), limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let request = ExecRequest { cmd, timeout };
        let workspace = self.paths.workspace();
        debug!(sandbox = %self.config.name, cmd, "executing");

        tokio::select! {
            result = self.host.exec(&self.resource, &workspace, &request) => result,
            _ = self.finished.cancelled() => Err(SandboxError::ExecFailed(format!(
                "sandbox {} stopped during execution",
                self.config.name
            ))),
        }
    }

    /// Stop the sandbox. Failures are logged; the sandbox always ends up in a
    /// terminal state.
    pub async fn stop(&self) {
        self.halt(false).await;
    }

    async fn halt(&self, timed_out: bool) {
        let _guard = self.lifecycle.lock().await;

        if self.transition(SandboxState::Created, SandboxState::Stopped) {
            self.finish(None);
            return;
        }
        if self.refresh().await != SandboxState::Running {
            return;
        }

        if timed_out {
            self.timed_out.store(true, Ordering::Release);
        }
        self.stopping.store(true, Ordering::Release);
        if let Err(e) = self.host.stop(&self.resource, self.stop_grace).await {
            warn!(sandbox = %self.config.name, error = %e, "failed to stop sandbox");
        }
        let exit_code = self.host.exit_code(&self.resource).await.unwrap_or_default();

        if self.transition(SandboxState::Running, SandboxState::Stopped) {
            self.finish(exit_code);
            info!(sandbox = %self.config.name, timed_out, "sandbox stopped");
        }
    }

    /// Wait until the sandbox is no longer running or `cancel` fires, and
    /// return the state observed. Returns at once for a sandbox that was
    /// never started.
    pub async fn wait_for_completion(&self, cancel: &CancellationToken) -> SandboxState {
        loop {
            let state = self.refresh().await;
            if state != SandboxState::Running {
                return state;
            }
            tokio::select! {
                _ = cancel.cancelled() => return self.state(),
                _ = self.finished.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Raw log, including the entry script's markers.
    pub async fn logs(&self) -> Result<String> {
        match tokio::fs::read(self.paths.log()).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Output of the command without the entry script's markers.
    pub async fn output(&self) -> Result<String> {
        Ok(strip_markers(&self.logs().await?))
    }

    pub async fn extract_artifacts(&self, patterns: &[String]) -> Result<Vec<Artifact>> {
        artifacts::collect(&self.paths.workspace(), patterns).await
    }

    /// Stop, release the host resource, delete the sandbox directory and
    /// forget the name. Safe to call more than once.
    pub async fn cleanup(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.watchdog.cancel();
        self.stop().await;

        if let Err(e) = self.host.remove(&self.resource).await {
            warn!(sandbox = %self.config.name, error = %e, "failed to remove host resource");
        }
        match tokio::fs::remove_dir_all(self.paths.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                sandbox = %self.config.name,
                path = %self.paths.root().display(),
                error = %e,
                "failed to delete sandbox directory"
            ),
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
        }
        info!(sandbox = %self.config.name, "sandbox cleaned up");
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SandboxStatus {
        let state = self.state();
        let timing = self.timing();
        SandboxStatus {
            name: self.config.name.clone(),
            label: self.config.label.clone(),
            state,
            running: state == SandboxState::Running,
            start_time: timing.start_time,
            duration: timing.duration,
            exit_code: timing.exit_code,
            timed_out: self.timed_out.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.config.name)
            .field("resource", &self.resource)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
