use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, ExecResult, LaunchSpec};

/// Runtime that provides the actual isolation (containers, plain process
/// groups, ...). Resources are addressed by name so they can be rediscovered
/// after a restart.
#[async_trait]
pub trait Host: Send + Sync {
    /// Human-readable backend name (e.g. "process", "docker").
    fn name(&self) -> &str;

    /// Start the entry script described by `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Run `request.cmd` inside the resource with `workspace` as working
    /// directory. Output is stdout and stderr combined.
    async fn exec(&self, resource: &str, workspace: &Path, request: &ExecRequest<'_>) -> Result<ExecResult>;

    async fn is_running(&self, resource: &str) -> Result<bool>;

    /// Exit code of the entry script, once it has exited.
    async fn exit_code(&self, resource: &str) -> Result<Option<i32>>;

    /// Terminate, escalating to a kill after `grace`. Stopping a resource
    /// that is not running succeeds.
    async fn stop(&self, resource: &str, grace: Duration) -> Result<()>;

    /// Release everything held for the resource. Removing an unknown
    /// resource succeeds.
    async fn remove(&self, resource: &str) -> Result<()>;

    /// Every resource whose name starts with `prefix`, including ones left
    /// behind by a previous process.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
