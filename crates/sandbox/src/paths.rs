use std::path::{Path, PathBuf};

/// Prefix of the lines the entry script writes around the user command.
pub const MARKER_PREFIX: &str = "==> sandbox ";

/// Per-sandbox directory layout:
///
/// ```text
/// <root>/<name>/
///   entrypoint.sh
///   sandbox.log
///   workspace/
/// ```
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    root: PathBuf,
}

impl SandboxPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn entrypoint(&self) -> PathBuf {
        self.root.join("entrypoint.sh")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("sandbox.log")
    }
}

/// Entry script for a sandbox. It resolves paths relative to its own
/// location so it works both on the host and inside a container.
pub fn entry_script(name: &str, command: &str) -> String {
    let body = if command.trim().is_empty() {
        // Idle: sleep in the background so TERM is handled immediately.
        "trap 'exit 143' TERM INT\nwhile :; do\n  sleep 3600 &\n  wait $!\ndone".to_string()
    } else {
        format!("(\n{command}\n)")
    };

    format!(
        r#"#!/usr/bin/env bash
SANDBOX_ROOT="$(cd "$(dirname "$0")" && pwd)"
exec >>"$SANDBOX_ROOT/sandbox.log" 2>&1
cd "$SANDBOX_ROOT/workspace" || exit 1
echo "{MARKER_PREFIX}{name} start $(date -u +%Y-%m-%dT%H:%M:%SZ)"
{body}
status=$?
echo "{MARKER_PREFIX}{name} end status=$status $(date -u +%Y-%m-%dT%H:%M:%SZ)"
exit $status
"#
    )
}

/// Log contents without the entry script's marker lines.
pub fn strip_markers(log: &str) -> String {
    log.lines()
        .filter(|line| !line.starts_with(MARKER_PREFIX))
        .map(|line| format!("{line}\n"))
        .collect()
}
