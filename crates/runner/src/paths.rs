use std::path::{Path, PathBuf};

/// Engine-level paths derived from the base directory.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    base_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    /// Held by `serve` for as long as it owns the base directory.
    pub fn lock(&self) -> PathBuf {
        self.base_dir.join("engine.lock")
    }

    /// Task requests written by `submit`, picked up by `serve`.
    pub fn spool(&self) -> PathBuf {
        self.base_dir.join("spool")
    }

    pub fn rejected(&self) -> PathBuf {
        self.spool().join("rejected")
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    pub fn sandboxes(&self) -> PathBuf {
        self.base_dir.join("sandboxes")
    }

    /// Pid and exit files of the subprocess host.
    pub fn host_state(&self) -> PathBuf {
        self.base_dir.join("host-state")
    }

    pub fn store(&self) -> PathBuf {
        self.base_dir.join("store")
    }

    pub fn artifacts(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }

    /// Directories `serve` creates before anything else runs.
    pub fn all_dirs(&self) -> [PathBuf; 7] {
        [
            self.spool(),
            self.rejected(),
            self.checkpoints(),
            self.sandboxes(),
            self.host_state(),
            self.store(),
            self.artifacts(),
        ]
    }
}
