use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use sandbox::{ExecRequest, ExecResult, Host, LaunchSpec, Mount, Result, SandboxError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::process::{GroupGuard, exit_code, is_alive, signal_group};

const PID_SUFFIX: &str = ".pid";
const EXIT_SUFFIX: &str = ".exit";
const STOP_POLL: Duration = Duration::from_millis(50);
/// How long to wait for a group to vanish after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

struct Launched {
    child: Child,
    pid: i32,
    env: BTreeMap<String, String>,
    exit: Option<i32>,
}

/// Runs each sandbox as a plain process group on this machine. There is no
/// isolation beyond the working directory; use it for trusted workloads or
/// development.
///
/// PID files under `state_dir` let a new process find sandboxes started by a
/// previous one, so orphan sweeps can stop them.
pub struct ProcessHost {
    state_dir: PathBuf,
    launched: Mutex<HashMap<String, Launched>>,
}

impl ProcessHost {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            launched: Mutex::new(HashMap::new()),
        })
    }

    fn launched(&self) -> MutexGuard<'_, HashMap<String, Launched>> {
        self.launched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pid_file(&self, resource: &str) -> PathBuf {
        self.state_dir.join(format!("{resource}{PID_SUFFIX}"))
    }

    fn exit_file(&self, resource: &str) -> PathBuf {
        self.state_dir.join(format!("{resource}{EXIT_SUFFIX}"))
    }

    async fn read_number(path: &Path) -> Option<i32> {
        tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
    }

    /// Reap the child if it has exited and remember its code.
    fn poll_child(&self, resource: &str) -> Option<PollState> {
        let mut launched = self.launched();
        let entry = launched.get_mut(resource)?;
        if let Some(code) = entry.exit {
            return Some(PollState::Exited(code));
        }
        match entry.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code(status);
                entry.exit = Some(code);
                Some(PollState::Exited(code))
            }
            Ok(None) => Some(PollState::Running(entry.pid)),
            Err(e) => {
                warn!(resource, error = %e, "failed to poll sandbox process");
                Some(PollState::Running(entry.pid))
            }
        }
    }

    async fn record_exit(&self, resource: &str, code: i32) {
        if let Err(e) = tokio::fs::write(self.exit_file(resource), code.to_string()).await {
            debug!(resource, error = %e, "failed to record exit code");
        }
    }

    /// PID of a live process group for `resource`, ours or left behind.
    async fn live_pid(&self, resource: &str) -> Option<i32> {
        match self.poll_child(resource) {
            Some(PollState::Running(pid)) => Some(pid),
            Some(PollState::Exited(code)) => {
                self.record_exit(resource, code).await;
                None
            }
            None => Self::read_number(&self.pid_file(resource))
                .await
                .filter(|pid| is_alive(*pid)),
        }
    }
}

enum PollState {
    Running(i32),
    Exited(i32),
}

#[async_trait]
impl Host for ProcessHost {
    fn name(&self) -> &str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        if self.live_pid(&spec.resource).await.is_some() {
            return Err(SandboxError::StartFailed(format!(
                "{} is already running",
                spec.resource
            )));
        }
        let _ = tokio::fs::remove_file(self.exit_file(&spec.resource)).await;

        let mut env = spec.env.clone();
        env.insert("SANDBOX_RESOURCE".into(), spec.resource.clone());
        if let Mount::Bind { path, .. } = &spec.mount {
            env.insert("SANDBOX_SOURCE".into(), path.display().to_string());
        }

        let child = Command::new("bash")
            .arg(&spec.entrypoint)
            .current_dir(&spec.workspace)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| SandboxError::StartFailed(format!("spawn {}: {e}", spec.entrypoint.display())))?;

        let pid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| SandboxError::StartFailed(format!("{} exited immediately", spec.resource)))?;
        tokio::fs::write(self.pid_file(&spec.resource), pid.to_string()).await?;

        self.launched().insert(
            spec.resource.clone(),
            Launched {
                child,
                pid,
                env,
                exit: None,
            },
        );
        info!(resource = %spec.resource, pid, "process sandbox launched");
        Ok(())
    }

    async fn exec(&self, resource: &str, workspace: &Path, request: &ExecRequest<'_>) -> Result<ExecResult> {
        let env = self
            .launched()
            .get(resource)
            .map(|entry| entry.env.clone())
            .ok_or_else(|| SandboxError::NotFound(resource.to_string()))?;

        let child = Command::new("bash")
            .arg("-c")
            .arg(format!("exec 2>&1\n{}", request.cmd))
            .current_dir(workspace)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("spawn bash: {e}")))?;
        let guard = GroupGuard::new(&child);

        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| SandboxError::ExecTimeout(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| SandboxError::ExecFailed(format!("wait: {e}")))?;
        guard.disarm();

        Ok(ExecResult {
            exit_code: exit_code(output.status),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn is_running(&self, resource: &str) -> Result<bool> {
        Ok(self.live_pid(resource).await.is_some())
    }

    async fn exit_code(&self, resource: &str) -> Result<Option<i32>> {
        match self.poll_child(resource) {
            Some(PollState::Exited(code)) => Ok(Some(code)),
            Some(PollState::Running(_)) => Ok(None),
            None => Ok(Self::read_number(&self.exit_file(resource)).await),
        }
    }

    async fn stop(&self, resource: &str, grace: Duration) -> Result<()> {
        let Some(pid) = self.live_pid(resource).await else {
            return Ok(());
        };

        debug!(resource, pid, "sending SIGTERM");
        signal_group(pid, Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.live_pid(resource).await.is_none() {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        warn!(resource, pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);
        let deadline = tokio::time::Instant::now() + KILL_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.live_pid(resource).await.is_none() {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        Err(SandboxError::Host(format!("{resource} (pid {pid}) survived SIGKILL")))
    }

    async fn remove(&self, resource: &str) -> Result<()> {
        self.stop(resource, Duration::ZERO).await?;
        self.launched().remove(resource);
        for path in [self.pid_file(resource), self.exit_file(resource)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut found: BTreeSet<String> = self
            .launched()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();

        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(resource) = name.strip_suffix(PID_SUFFIX)
                && resource.starts_with(prefix)
            {
                found.insert(resource.to_string());
            }
        }
        Ok(found.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path, resource: &str, script: &str) -> LaunchSpec {
        let root = dir.join(resource);
        let workspace = root.join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let entrypoint = root.join("entrypoint.sh");
        std::fs::write(&entrypoint, script).unwrap();
        LaunchSpec {
            resource: resource.to_string(),
            label: String::new(),
            log: root.join("sandbox.log"),
            root,
            workspace,
            entrypoint,
            mount: Mount::None,
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
        }
    }

    async fn wait_exit(host: &ProcessHost, resource: &str) -> Option<i32> {
        for _ in 0..100 {
            if !host.is_running(resource).await.unwrap() {
                return host.exit_code(resource).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{resource} did not exit");
    }

    #[tokio::test]
    async fn launched_script_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path().join("state")).unwrap();
        let spec = spec(dir.path(), "sbx-exit", "exit 4\n");

        host.launch(&spec).await.unwrap();
        assert_eq!(wait_exit(&host, "sbx-exit").await, Some(4));
        assert!(dir.path().join("state/sbx-exit.exit").exists());
    }

    #[tokio::test]
    async fn exec_combines_output_and_sees_env() {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path().join("state")).unwrap();
        let spec = spec(dir.path(), "sbx-exec", "sleep 30\n");
        host.launch(&spec).await.unwrap();

        let request = ExecRequest {
            cmd: "echo \"$GREETING\"; echo oops >&2; pwd; exit 3",
            timeout: None,
        };
        let result = host.exec("sbx-exec", &spec.workspace, &request).await.unwrap();
        assert_eq!(result.exit_code, 3);
        let workspace = spec.workspace.canonicalize().unwrap();
        assert_eq!(result.output, format!("hello\noops\n{}\n", workspace.display()));

        host.remove("sbx-exec").await.unwrap();
    }

    #[tokio::test]
    async fn exec_timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path().join("state")).unwrap();
        let spec = spec(dir.path(), "sbx-slow", "sleep 30\n");
        host.launch(&spec).await.unwrap();

        let request = ExecRequest {
            cmd: "sleep 30",
            timeout: Some(Duration::from_millis(200)),
        };
        let started = std::time::Instant::now();
        let err = host.exec("sbx-slow", &spec.workspace, &request).await.unwrap_err();
        assert!(matches!(err, SandboxError::ExecTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        host.remove("sbx-slow").await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path().join("state")).unwrap();
        let spec = spec(dir.path(), "sbx-stubborn", "trap '' TERM\nwhile :; do sleep 0.1; done\n");
        host.launch(&spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        host.stop("sbx-stubborn", Duration::from_millis(200)).await.unwrap();
        assert!(!host.is_running("sbx-stubborn").await.unwrap());
        assert_eq!(host.exit_code("sbx-stubborn").await.unwrap(), Some(137));
    }

    #[tokio::test]
    async fn orphans_are_found_through_pid_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let spec = spec(dir.path(), "sbx-orphan", "sleep 30\n");
        {
            let first = ProcessHost::new(&state).unwrap();
            first.launch(&spec).await.unwrap();
            // Forget the child without killing it, as a crash would.
            let launched = first.launched().remove("sbx-orphan").unwrap();
            std::mem::forget(launched.child);
        }

        let second = ProcessHost::new(&state).unwrap();
        assert_eq!(second.list("sbx-").await.unwrap(), ["sbx-orphan"]);
        assert!(second.is_running("sbx-orphan").await.unwrap());

        second.remove("sbx-orphan").await.unwrap();
        assert!(!second.is_running("sbx-orphan").await.unwrap());
        assert!(second.list("sbx-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopping_unknown_resources_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let host = ProcessHost::new(dir.path()).unwrap();
        host.stop("sbx-none", Duration::from_millis(10)).await.unwrap();
        host.remove("sbx-none").await.unwrap();
        assert_eq!(host.exit_code("sbx-none").await.unwrap(), None);
    }
}
