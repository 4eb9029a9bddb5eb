use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::trace;

/// A host command that could not be run or exited non-zero.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl CommandError {
    /// Docker and friends report unknown objects on stderr; there is no
    /// dedicated exit code for it.
    pub fn is_missing_object(&self) -> bool {
        let detail = self.detail.to_ascii_lowercase();
        detail.contains("no such container") || detail.contains("no such object")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo -n`.
    Sudo,
    User,
}

/// `program`, prefixed with `sudo -n` when the privilege asks for it.
pub fn base(program: &str, privilege: Privilege) -> Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        }
        Privilege::User => Command::new(program),
    }
}

fn command(program: &str, args: &[&str], privilege: Privilege) -> (Command, String) {
    let mut cmd = base(program, privilege);
    cmd.args(args).stdin(Stdio::null());

    let mut words = Vec::with_capacity(args.len() + 2);
    if privilege == Privilege::Sudo {
        words.push("sudo");
    }
    words.push(program);
    words.extend_from_slice(args);
    (cmd, words.join(" "))
}

/// Run to completion and hand back the raw output, whatever the exit status.
pub async fn run(program: &str, args: &[&str], privilege: Privilege) -> Result<Output, CommandError> {
    let (mut cmd, shown) = command(program, args, privilege);
    trace!(command = %shown, "run");
    cmd.output().await.map_err(|e| CommandError {
        command: shown,
        detail: e.to_string(),
    })
}

/// Run and return trimmed stdout. A non-zero exit is an error carrying stderr.
pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, CommandError> {
    let output = run(program, args, privilege).await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let (_, shown) = command(program, args, privilege);
        Err(CommandError {
            command: shown,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_command_includes_sudo() {
        let (_, shown) = command("docker", &["rm", "-f", "sbx-1"], Privilege::Sudo);
        assert_eq!(shown, "sudo docker rm -f sbx-1");
        let (_, shown) = command("docker", &["ps"], Privilege::User);
        assert_eq!(shown, "docker ps");
    }

    #[test]
    fn sudo_base_wraps_the_program() {
        let cmd = base("docker", Privilege::Sudo);
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "sudo");
        assert_eq!(std.get_args().collect::<Vec<_>>(), ["-n", "docker"]);
        assert_eq!(base("docker", Privilege::User).as_std().get_program(), "docker");
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec("printf", &["%s-%s\\n", "a", "b"], Privilege::User).await.unwrap();
        assert_eq!(output, "a-b");
    }

    #[tokio::test]
    async fn exec_error_carries_stderr() {
        let err = exec("bash", &["-c", "echo 'Error: No such container: x' >&2; exit 1"], Privilege::User)
            .await
            .unwrap_err();
        assert!(err.command.starts_with("bash -c"));
        assert!(err.is_missing_object(), "detail was: {}", err.detail);
    }

    #[tokio::test]
    async fn run_reports_exit_status_without_failing() {
        let output = run("bash", &["-c", "exit 3"], Privilege::User).await.unwrap();
        assert_eq!(output.status.code(), Some(3));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run("definitely-not-a-real-binary", &[], Privilege::User).await.unwrap_err();
        assert_eq!(err.command, "definitely-not-a-real-binary");
    }
}
