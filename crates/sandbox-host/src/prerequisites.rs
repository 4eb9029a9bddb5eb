use std::path::Path;

use sandbox::SandboxError;

use crate::command::{Privilege, exec};
use crate::docker::DockerConfig;

/// Commands every backend relies on: the entry script runs under bash and
/// copy-mode sources of git repositories are cloned.
const BASE_COMMANDS: &[&str] = &["bash", "git"];

/// Check what the process backend needs. All failures are reported together.
pub async fn check_process_host(state_dir: &Path) -> Result<(), SandboxError> {
    let mut errors = Vec::new();
    check_commands(BASE_COMMANDS, &mut errors);
    check_writable_dir(state_dir, "state directory", &mut errors).await;
    finish(errors)
}

/// Check that the docker CLI is installed and the daemon answers.
pub async fn check_docker(config: &DockerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();
    check_commands(BASE_COMMANDS, &mut errors);
    if which::which(&config.binary).is_err() {
        errors.push(format!("required command not found: {}", config.binary));
    } else {
        let privilege = if config.sudo { Privilege::Sudo } else { Privilege::User };
        if let Err(e) = exec(&config.binary, &["info", "--format", "{{.ServerVersion}}"], privilege).await {
            errors.push(format!("docker daemon not reachable: {}", e.detail));
        }
    }
    finish(errors)
}

fn check_commands(commands: &[&str], errors: &mut Vec<String>) {
    for cmd in commands {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_writable_dir(dir: &Path, label: &str, errors: &mut Vec<String>) {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        errors.push(format!("{label} {} cannot be created: {e}", dir.display()));
        return;
    }
    let probe = dir.join(".write-probe");
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
        }
        Err(e) => errors.push(format!("{label} {} is not writable: {e}", dir.display())),
    }
}

fn finish(errors: Vec<String>) -> Result<(), SandboxError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}
