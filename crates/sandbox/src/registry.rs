use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, SandboxConfig, SourceMount};
use crate::error::{Result, SandboxError};
use crate::host::Host;
use crate::paths::{SandboxPaths, entry_script};
use crate::sandbox::Sandbox;

type Slot = Arc<OnceCell<Arc<Sandbox>>>;

pub(crate) struct RegistryInner {
    host: Arc<dyn Host>,
    config: RegistryConfig,
    /// Held only to look up or insert slots; creation runs outside it.
    sandboxes: Mutex<HashMap<String, Slot>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RegistryInner {
    pub(crate) fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub(crate) fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget `sandbox` unless its name has since been taken by another one.
    pub(crate) fn unregister(&self, sandbox: &Sandbox) {
        let mut map = self.map();
        let owned = map
            .get(sandbox.name())
            .and_then(|slot| slot.get())
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), sandbox));
        if owned {
            map.remove(sandbox.name());
        }
    }
}

/// What [`SandboxRegistry::sweep_orphans`] removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub resources: Vec<String>,
    pub directories: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.directories.is_empty()
    }
}

/// Owns every live sandbox by name, plus the timers that act on them
/// (watchdogs and delayed cleanups).
#[derive(Clone)]
pub struct SandboxRegistry {
    inner: Arc<RegistryInner>,
}

impl SandboxRegistry {
    pub fn new(host: Arc<dyn Host>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                host,
                config,
                sandboxes: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Create the sandbox called `config.name`, or return the live one with
    /// that name. Concurrent calls for one name build it once.
    pub async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        config.validate()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(SandboxError::CreationFailed(
                "sandbox registry is shut down".into(),
            ));
        }

        let name = config.name.clone();
        let slot = Arc::clone(self.inner.map().entry(name.clone()).or_default());

        let result = slot.get_or_try_init(|| self.build(config)).await.cloned();
        if result.is_err() {
            let mut map = self.inner.map();
            if map
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
            {
                map.remove(&name);
            }
        }
        result
    }

    async fn build(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        let paths = SandboxPaths::new(self.inner.config.root.join(&config.name));
        let resource = format!("{}{}", self.inner.config.resource_prefix, config.name);

        // A resource or directory with this name can only be a leftover.
        if let Err(e) = self.inner.host.remove(&resource).await {
            warn!(resource, error = %e, "failed to remove stale host resource");
        }
        match tokio::fs::remove_dir_all(paths.root()).await {
            Ok(()) => debug!(sandbox = %config.name, "removed stale sandbox directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::CreationFailed(format!(
                    "remove stale {}: {e}",
                    paths.root().display()
                )));
            }
        }

        if let Err(e) = prepare(&paths, &config).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(paths.root()).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(sandbox = %config.name, error = %cleanup, "failed to remove partial sandbox");
            }
            return Err(e);
        }

        info!(sandbox = %config.name, label = %config.label, "sandbox created");
        Ok(Arc::new(Sandbox::new(config, paths, &self.inner)))
    }

    pub fn get(&self, name: &str) -> Result<Arc<Sandbox>> {
        self.inner
            .map()
            .get(name)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| SandboxError::NotFound(name.to_string()))
    }

    fn is_registered(&self, name: &str) -> bool {
        self.inner.map().contains_key(name)
    }

    /// Snapshot of live sandboxes, sorted by name.
    pub fn list(&self) -> Vec<Arc<Sandbox>> {
        let mut sandboxes: Vec<_> = self
            .inner
            .map()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        sandboxes.sort_by(|a, b| a.name().cmp(b.name()));
        sandboxes
    }

    /// Remove host resources carrying the registry prefix and sandbox
    /// directories that no live sandbox owns, e.g. after a crash.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let prefix = &self.inner.config.resource_prefix;
        let live: HashSet<String> = self.inner.map().keys().cloned().collect();
        let mut report = SweepReport::default();

        for resource in self.inner.host.list(prefix).await? {
            let name = resource.strip_prefix(prefix.as_str()).unwrap_or(&resource);
            if live.contains(name) {
                continue;
            }
            if let Err(e) = self.inner.host.stop(&resource, self.inner.config.stop_grace).await {
                warn!(resource, error = %e, "failed to stop orphaned resource");
            }
            match self.inner.host.remove(&resource).await {
                Ok(()) => report.resources.push(resource),
                Err(e) => warn!(resource, error = %e, "failed to remove orphaned resource"),
            }
        }

        let mut entries = match tokio::fs::read_dir(&self.inner.config.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) || self.is_registered(&name) {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => report.directories.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale directory"),
            }
        }

        if !report.is_empty() {
            info!(
                resources = report.resources.len(),
                directories = report.directories.len(),
                "swept orphaned sandboxes"
            );
        }
        Ok(report)
    }

    /// Clean up the sandbox currently called `name` after `delay`. Pending
    /// cleanups are dropped on [`shutdown`](Self::shutdown).
    pub fn schedule_cleanup(&self, name: &str, delay: Duration) -> Result<()> {
        let sandbox = self.get(name)?;
        let token = self.inner.shutdown.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(sandbox = %sandbox.name(), "delayed cleanup cancelled");
                }
                _ = tokio::time::sleep(delay) => sandbox.cleanup().await,
            }
        });
        Ok(())
    }

    /// Cancel timers, wait for them, and stop every running sandbox.
    /// Directories stay on disk for the next sweep.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        for sandbox in self.list() {
            sandbox.stop().await;
        }
        info!("sandbox registry shut down");
    }
}

async fn prepare(paths: &SandboxPaths, config: &SandboxConfig) -> Result<()> {
    let creation = |what: &str, e: std::io::Error| SandboxError::CreationFailed(format!("{what}: {e}"));

    tokio::fs::create_dir_all(paths.workspace())
        .await
        .map_err(|e| creation("create workspace", e))?;

    match &config.source {
        SourceMount::None => {}
        SourceMount::Copy(source) => populate(source, &paths.workspace()).await?,
        SourceMount::Bind { path, .. } => {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(SandboxError::CreationFailed(format!(
                    "source does not exist: {}",
                    path.display()
                )));
            }
        }
    }

    let entrypoint = paths.entrypoint();
    tokio::fs::write(&entrypoint, entry_script(&config.name, &config.command))
        .await
        .map_err(|e| creation("write entry script", e))?;
    tokio::fs::set_permissions(&entrypoint, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| creation("chmod entry script", e))?;
    tokio::fs::write(paths.log(), b"")
        .await
        .map_err(|e| creation("create log", e))?;
    Ok(())
}

fn is_git_repository(path: &Path) -> bool {
    path.join(".git").exists() || (path.join("HEAD").is_file() && path.join("objects").is_dir())
}

/// Fill `workspace` from `source`: a clone for git repositories, a plain
/// recursive copy otherwise.
async fn populate(source: &Path, workspace: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(SandboxError::CreationFailed(format!(
            "source is not a directory: {}",
            source.display()
        )));
    }

    if is_git_repository(source) {
        let output = tokio::process::Command::new("git")
            .args(["clone", "--quiet", "--"])
            .arg(source)
            .arg(workspace)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("spawn git: {e}")))?;
        if !output.status.success() {
            return Err(SandboxError::CreationFailed(format!(
                "git clone {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        return Ok(());
    }

    let source = source.to_path_buf();
    let workspace = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&source, &workspace))
        .await
        .map_err(|e| SandboxError::CreationFailed(format!("copy task: {e}")))?
        .map_err(|e| SandboxError::CreationFailed(format!("copy source: {e}")))
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = to.join(entry.file_name());
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if kind.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
