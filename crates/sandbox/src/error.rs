use std::time::Duration;

use crate::types::SandboxState;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox {name} is not running (state: {state})")]
    NotRunning { name: String, state: SandboxState },

    #[error("sandbox {name} already started (state: {state})")]
    AlreadyStarted { name: String, state: SandboxState },

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("execution timed out after {}s", .0.as_secs())]
    ExecTimeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("host error: {0}")]
    Host(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
