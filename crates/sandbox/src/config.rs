use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Longest accepted sandbox name; host resource names add a prefix.
const MAX_NAME_LEN: usize = 63;

/// Where the sandbox's working tree comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceMount {
    /// Detached, multi-purpose sandbox with an empty workspace.
    #[default]
    None,
    /// Clone (git repositories) or copy the tree into the workspace.
    Copy(PathBuf),
    /// Expose the tree in place, read-only where the host supports it.
    Bind { path: PathBuf, read_only: bool },
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub name: String,
    pub source: SourceMount,
    pub label: String,
    /// Shell script run by the entry point. Empty keeps the sandbox idle
    /// until stopped, for use through `execute`.
    pub command: String,
    /// Wall-clock limit enforced by the watchdog. Zero disables it.
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SourceMount::None,
            label: String::new(),
            command: String::new(),
            timeout: Duration::ZERO,
            env: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, source: SourceMount) -> Self {
        self.source = source;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn is_idle(&self) -> bool {
        self.command.trim().is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        for key in self.env.keys() {
            let valid = !key.is_empty()
                && !key.starts_with(|c: char| c.is_ascii_digit())
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(SandboxError::InvalidConfig(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }
        match &self.source {
            SourceMount::Copy(path) | SourceMount::Bind { path, .. } if !path.is_absolute() => {
                Err(SandboxError::InvalidConfig(format!(
                    "source path must be absolute: {}",
                    path.display()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Names become directory and container names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(SandboxError::InvalidConfig(format!(
            "sandbox name must be 1-{MAX_NAME_LEN} characters: {name:?}"
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(SandboxError::InvalidConfig(format!(
            "sandbox name may only contain [A-Za-z0-9_.-] and must start alphanumeric: {name:?}"
        )));
    }
    Ok(())
}

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Parent of every sandbox directory.
    pub root: PathBuf,
    /// Prepended to sandbox names to form host resource names. Orphan
    /// sweeps only touch resources carrying it.
    pub resource_prefix: String,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// How often `wait_for_completion` asks the host.
    pub poll_interval: Duration,
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            resource_prefix: "sbx-".into(),
            stop_grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_names() {
        for name in ["job-1", "run_42.retry", "a"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_path_like_or_long_names() {
        let long = "x".repeat(64);
        for name in ["", "../up", "a/b", "-flag", ".hidden", "sp ace", long.as_str()] {
            assert!(validate_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn relative_source_is_rejected() {
        let config = SandboxConfig::new("s1").with_source(SourceMount::Copy("repo".into()));
        assert!(matches!(
            config.validate(),
            Err(SandboxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn env_names_are_checked() {
        assert!(SandboxConfig::new("s1").with_env("CI", "1").validate().is_ok());
        assert!(SandboxConfig::new("s1").with_env("1BAD", "x").validate().is_err());
        assert!(SandboxConfig::new("s1").with_env("A-B", "x").validate().is_err());
    }

    #[test]
    fn blank_command_means_idle() {
        assert!(SandboxConfig::new("s").with_command("  \n").is_idle());
        assert!(!SandboxConfig::new("s").with_command("make test").is_idle());
    }
}
