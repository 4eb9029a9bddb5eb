use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Completed = 3,
    Failed = 4,
}

impl SandboxState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopped,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// How the host should expose the source tree to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Workspace only.
    None,
    /// Expose `path` next to the workspace.
    Bind { path: PathBuf, read_only: bool },
}

/// Everything a [`crate::Host`] needs to launch one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Host-visible resource name (registry prefix + sandbox name).
    pub resource: String,
    pub label: String,
    /// Directory holding the entry script, log and workspace.
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub entrypoint: PathBuf,
    pub log: PathBuf,
    pub mount: Mount,
    pub env: BTreeMap<String, String>,
}

pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    /// `None` waits as long as the command runs.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    /// stdout and stderr, interleaved.
    pub output: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Snapshot returned by [`crate::Sandbox::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,
    pub label: String,
    pub state: SandboxState,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// Set once the sandbox is no longer running.
    #[serde(with = "opt_millis", rename = "durationMs")]
    pub duration: Option<Duration>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

mod opt_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }
}
