mod artifacts;
mod config;
mod error;
mod host;
mod paths;
mod registry;
mod sandbox;
#[cfg(test)]
mod test_support;
mod types;

pub use artifacts::{Artifact, collect as collect_artifacts};
pub use config::{RegistryConfig, SandboxConfig, SourceMount, validate_name};
pub use error::{Result, SandboxError};
pub use host::Host;
pub use paths::{MARKER_PREFIX, SandboxPaths, entry_script, strip_markers};
pub use registry::{SandboxRegistry, SweepReport};
pub use sandbox::Sandbox;
pub use types::{ExecRequest, ExecResult, LaunchSpec, Mount, SandboxState, SandboxStatus};
