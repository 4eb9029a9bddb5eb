use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecRequest, ExecResult, Host, LaunchSpec, Mount, Result, SandboxError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{self, CommandError, Privilege, exec, run};
use crate::process::{current_user, exit_code};

/// Where the sandbox directory appears inside the container.
const CONTAINER_ROOT: &str = "/sandbox";
const CONTAINER_WORKSPACE: &str = "/sandbox/workspace";
const CONTAINER_SOURCE: &str = "/sandbox/source";
const MANAGED_LABEL: &str = "dev.sandbox.managed=true";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    pub binary: String,
    /// Run the docker CLI through `sudo -n`.
    pub sudo: bool,
    /// `--network` value; `none` disables networking.
    pub network: Option<String>,
    /// `--memory`, e.g. `2g`.
    pub memory: Option<String>,
    /// `--cpus`, e.g. `1.5`.
    pub cpus: Option<String>,
    /// Run as the invoking user so files in the workspace stay removable.
    pub run_as_caller: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "debian:stable-slim".into(),
            binary: "docker".into(),
            sudo: false,
            network: None,
            memory: None,
            cpus: None,
            run_as_caller: true,
        }
    }
}

/// Runs each sandbox as a detached container through the docker CLI. The
/// sandbox directory is mounted at `/sandbox`; bound sources at
/// `/sandbox/source`.
pub struct DockerHost {
    config: DockerConfig,
}

impl DockerHost {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn privilege(&self) -> Privilege {
        if self.config.sudo {
            Privilege::Sudo
        } else {
            Privilege::User
        }
    }

    async fn docker(&self, args: &[&str]) -> std::result::Result<String, CommandError> {
        exec(&self.config.binary, args, self.privilege()).await
    }

    /// `docker inspect` a single field; `None` if the container is gone.
    async fn inspect(&self, resource: &str, format: &str) -> Result<Option<String>> {
        match self.docker(&["inspect", "--type", "container", "-f", format, resource]).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_missing_object() => Ok(None),
            Err(e) => Err(host_error(e)),
        }
    }

    fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.resource.clone(),
            "--label".into(),
            MANAGED_LABEL.into(),
            "--label".into(),
            format!("dev.sandbox.label={}", spec.label),
            "--volume".into(),
            format!("{}:{CONTAINER_ROOT}", spec.root.display()),
            "--workdir".into(),
            CONTAINER_WORKSPACE.into(),
            "--env".into(),
            format!("SANDBOX_RESOURCE={}", spec.resource),
        ];
        if let Mount::Bind { path, read_only } = &spec.mount {
            let mode = if *read_only { "ro" } else { "rw" };
            args.push("--volume".into());
            args.push(format!("{}:{CONTAINER_SOURCE}:{mode}", path.display()));
            args.push("--env".into());
            args.push(format!("SANDBOX_SOURCE={CONTAINER_SOURCE}"));
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        if self.config.run_as_caller {
            args.push("--user".into());
            args.push(current_user());
        }
        for (flag, value) in [
            ("--network", &self.config.network),
            ("--memory", &self.config.memory),
            ("--cpus", &self.config.cpus),
        ] {
            if let Some(value) = value {
                args.push(flag.into());
                args.push(value.clone());
            }
        }
        args.push(self.config.image.clone());
        args.push("bash".into());
        args.push(format!("{CONTAINER_ROOT}/entrypoint.sh"));
        args
    }
}

fn host_error(e: CommandError) -> SandboxError {
    SandboxError::Host(e.to_string())
}

#[async_trait]
impl Host for DockerHost {
    fn name(&self) -> &str {
        "docker"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let args = self.run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .docker(&args)
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        info!(resource = %spec.resource, container = %id, image = %self.config.image, "container launched");
        Ok(())
    }

    async fn exec(&self, resource: &str, _workspace: &Path, request: &ExecRequest<'_>) -> Result<ExecResult> {
        let script = format!("exec 2>&1\n{}", request.cmd);
        let mut cmd = command::base(&self.config.binary, self.privilege());
        cmd.args(["exec", "--workdir", CONTAINER_WORKSPACE, resource, "bash", "-c"])
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(resource, cmd = request.cmd, "docker exec");

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("spawn {}: {e}", self.config.binary)))?;
        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| SandboxError::ExecTimeout(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| SandboxError::ExecFailed(format!("wait: {e}")))?;

        // The docker CLI itself only writes to stderr when exec could not start.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecResult {
            exit_code: exit_code(output.status),
            output: text,
        })
    }

    async fn is_running(&self, resource: &str) -> Result<bool> {
        Ok(self.inspect(resource, "{{.State.Running}}").await?.as_deref() == Some("true"))
    }

    async fn exit_code(&self, resource: &str) -> Result<Option<i32>> {
        let Some(state) = self
            .inspect(resource, "{{.State.Running}} {{.State.ExitCode}}")
            .await?
        else {
            return Ok(None);
        };
        match state.split_once(' ') {
            Some(("false", code)) => Ok(code.trim().parse().ok()),
            _ => Ok(None),
        }
    }

    async fn stop(&self, resource: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        match self.docker(&["stop", "--time", &secs, resource]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_missing_object() => Ok(()),
            Err(e) => Err(host_error(e)),
        }
    }

    async fn remove(&self, resource: &str) -> Result<()> {
        match self.docker(&["rm", "--force", "--volumes", resource]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_missing_object() => Ok(()),
            Err(e) => Err(host_error(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let filter = format!("label={MANAGED_LABEL}");
        let output = run(
            &self.config.binary,
            &["ps", "--all", "--filter", &filter, "--format", "{{.Names}}"],
            self.privilege(),
        )
        .await
        .map_err(host_error)?;
        if !output.status.success() {
            return Err(SandboxError::Host(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;

    fn spec(mount: Mount) -> LaunchSpec {
        let root = PathBuf::from("/srv/sandboxes/ci-7");
        LaunchSpec {
            resource: "sbx-ci-7".into(),
            label: "action 7".into(),
            workspace: root.join("workspace"),
            entrypoint: root.join("entrypoint.sh"),
            log: root.join("sandbox.log"),
            root,
            mount,
            env: BTreeMap::from([("CI".to_string(), "true".to_string())]),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn run_args_mount_the_sandbox_directory() {
        let host = DockerHost::new(DockerConfig {
            run_as_caller: false,
            network: Some("none".into()),
            ..DockerConfig::default()
        });
        let args = host.run_args(&spec(Mount::None));

        assert_eq!(args[0], "run");
        assert!(has_pair(&args, "--name", "sbx-ci-7"));
        assert!(has_pair(&args, "--volume", "/srv/sandboxes/ci-7:/sandbox"));
        assert!(has_pair(&args, "--workdir", "/sandbox/workspace"));
        assert!(has_pair(&args, "--env", "CI=true"));
        assert!(has_pair(&args, "--network", "none"));
        assert!(!args.iter().any(|a| a == "--user" || a == "--memory"));
        assert_eq!(
            &args[args.len() - 3..],
            ["debian:stable-slim", "bash", "/sandbox/entrypoint.sh"]
        );
    }

    #[test]
    fn bind_mounts_are_read_only_when_asked() {
        let host = DockerHost::new(DockerConfig::default());
        let args = host.run_args(&spec(Mount::Bind {
            path: "/srv/repos/app".into(),
            read_only: true,
        }));
        assert!(has_pair(&args, "--volume", "/srv/repos/app:/sandbox/source:ro"));
        assert!(has_pair(&args, "--env", "SANDBOX_SOURCE=/sandbox/source"));
        assert!(args.iter().any(|a| a == "--user"));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: DockerConfig = serde_json::from_str(r#"{"image": "rust:1"}"#).unwrap();
        assert_eq!(config.image, "rust:1");
        assert_eq!(config.binary, "docker");
        assert!(config.run_as_caller);
    }
}
