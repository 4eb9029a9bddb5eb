use std::path::{Path, PathBuf};
use std::time::Duration;

use retry::BackoffPolicy;
use sandbox_host::DockerConfig;
use serde::{Deserialize, Serialize};
use task_queue::{DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_WORKERS};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub(crate) const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 60 * 60;
pub(crate) const DEFAULT_ARTIFACT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const CONFIG_FILE: &str = "runner.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub repositories: RepositoriesConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// Queued tasks accepted before `submit` sees "queue full". Zero means
    /// unbounded.
    pub capacity: usize,
    /// Added to a task's priority on every retry.
    pub demotion: i32,
    /// Delay between retries; absent re-enqueues immediately.
    pub retry_backoff: Option<BackoffPolicy>,
    pub dead_letter_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_QUEUE_CAPACITY,
            demotion: 1,
            retry_backoff: Some(BackoffPolicy::default()),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Process,
    Docker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: Backend,
    pub docker: DockerConfig,
    pub resource_prefix: String,
    pub stop_grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: Backend::Process,
            docker: DockerConfig::default(),
            resource_prefix: "sbx-".into(),
            stop_grace_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

impl SandboxSection {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Used when an action does not set its own timeout.
    pub default_timeout_secs: u64,
    /// Larger artifacts are skipped with a warning.
    pub artifact_max_bytes: u64,
    /// How long a finished sandbox is kept for inspection.
    pub cleanup_grace_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
            artifact_max_bytes: DEFAULT_ARTIFACT_MAX_BYTES,
            cleanup_grace_secs: 10 * 60,
        }
    }
}

impl ActionsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Completed checkpoints are deleted after this long.
    pub completed_grace_secs: u64,
    /// Failed checkpoints older than this are pruned by the stale sweep.
    pub retention_hours: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            completed_grace_secs: 5 * 60,
            retention_hours: 7 * 24,
        }
    }
}

impl CheckpointConfig {
    pub fn completed_grace(&self) -> Duration {
        Duration::from_secs(self.completed_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(60 * 60))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Zero disables the periodic report.
    pub report_interval_secs: u64,
    /// Zero disables the periodic stale sweep.
    pub stale_sweep_interval_secs: u64,
    /// Runs still pending or running after this long are abandoned.
    pub stale_run_after_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 5 * 60,
            stale_sweep_interval_secs: 15 * 60,
            stale_run_after_secs: 2 * 60 * 60,
        }
    }
}

impl MaintenanceConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }

    pub fn stale_run_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoriesConfig {
    /// Holds one git repository per repo id (`<id>` or `<id>.git`).
    pub root: PathBuf,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("repos"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Program and arguments; the prompt is written to its stdin. Empty
    /// leaves AI tasks without a model provider.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl AiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command_timeout_secs: u64,
    pub cleanup_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10 * 60,
            cleanup_grace_secs: 5 * 60,
        }
    }
}

impl AgentConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub poll_interval_ms: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl SpoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EngineConfig {
    /// Defaults everywhere, rooted at `base_dir`.
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            repositories: RepositoriesConfig {
                root: base_dir.join("repos"),
            },
            base_dir,
            queue: QueueConfig::default(),
            sandbox: SandboxSection::default(),
            actions: ActionsConfig::default(),
            checkpoints: CheckpointConfig::default(),
            maintenance: MaintenanceConfig::default(),
            ai: AiConfig::default(),
            agent: AgentConfig::default(),
            spool: SpoolConfig::default(),
        }
    }

    /// Queue capacity as the queue takes it.
    pub fn queue_capacity(&self) -> Option<usize> {
        (self.queue.capacity > 0).then_some(self.queue.capacity)
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        resolve(&mut self.repositories.root);
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.queue.workers == 0 {
            return Err(RunnerError::Config("queue.workers must be at least 1".into()));
        }
        if self.queue.demotion < 0 {
            return Err(RunnerError::Config("queue.demotion must not be negative".into()));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(RunnerError::Config("sandbox.poll_interval_ms must be positive".into()));
        }
        if self.spool.poll_interval_ms == 0 {
            return Err(RunnerError::Config("spool.poll_interval_ms must be positive".into()));
        }
        if let Some(program) = self.ai.command.first()
            && program.trim().is_empty()
        {
            return Err(RunnerError::Config("ai.command program is empty".into()));
        }
        if let Some(backoff) = &self.queue.retry_backoff
            && backoff.base > backoff.max
        {
            return Err(RunnerError::Config(
                "queue.retry_backoff.base_ms exceeds max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate an engine config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: EngineConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Write `runner.yaml` into the config's base directory and return its path.
pub async fn generate(config: &EngineConfig) -> RunnerResult<PathBuf> {
    let base_dir = &config.base_dir;
    tokio::fs::create_dir_all(base_dir)
        .await
        .map_err(|e| RunnerError::Config(format!("create {}: {e}", base_dir.display())))?;

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| RunnerError::Config(format!("serialize config: {e}")))?;

    let config_path = base_dir.join(CONFIG_FILE);
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| RunnerError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use retry::BackoffStrategy;

    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
base_dir: {base_dir}
queue:
  workers: 8
  capacity: 50
  demotion: 2
  retry_backoff:
    base_ms: 250
    max_ms: 10000
    strategy: fibonacci
sandbox:
  backend: docker
  docker:
    image: rust:1
    network: none
  stop_grace_secs: 3
actions:
  default_timeout_secs: 900
  artifact_max_bytes: 1024
ai:
  command: [llm, --no-stream]
"#,
            base_dir = dir.path().display(),
        );
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, &yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue_capacity(), Some(50));
        assert_eq!(config.queue.demotion, 2);
        let backoff = config.queue.retry_backoff.unwrap();
        assert_eq!(backoff.base, Duration::from_millis(250));
        assert_eq!(backoff.strategy, BackoffStrategy::Fibonacci);
        assert_eq!(config.sandbox.backend, Backend::Docker);
        assert_eq!(config.sandbox.docker.image, "rust:1");
        assert_eq!(config.sandbox.docker.network.as_deref(), Some("none"));
        assert_eq!(config.sandbox.stop_grace(), Duration::from_secs(3));
        assert_eq!(config.actions.default_timeout(), Duration::from_secs(900));
        assert_eq!(config.actions.artifact_max_bytes, 1024);
        assert_eq!(config.ai.command, ["llm", "--no-stream"]);
    }

    #[tokio::test]
    async fn load_defaults_for_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, "base_dir: engine\n").await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.queue.workers, DEFAULT_WORKERS);
        assert_eq!(config.queue_capacity(), Some(DEFAULT_QUEUE_CAPACITY));
        assert_eq!(config.sandbox.backend, Backend::Process);
        assert_eq!(config.actions.artifact_max_bytes, DEFAULT_ARTIFACT_MAX_BYTES);
        assert_eq!(config.actions.default_timeout_secs, DEFAULT_ACTION_TIMEOUT_SECS);
        assert!(config.ai.command.is_empty());
    }

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: engine\nrepositories:\n  root: git/repos\n";
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert!(config.base_dir.is_absolute());
        assert_eq!(config.base_dir, dir.path().join("engine"));
        assert_eq!(config.repositories.root, dir.path().join("git/repos"));
    }

    #[tokio::test]
    async fn load_rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, "base_dir: /tmp/x\nqueue:\n  workers: 0\n")
            .await
            .unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("workers"), "got: {err}");
    }

    #[tokio::test]
    async fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("runner.yaml");
        tokio::fs::write(&config_path, "base_dir: [unclosed\n").await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let mut config = EngineConfig::new("/srv/engine".into());
        config.queue.capacity = 0;
        assert_eq!(config.queue_capacity(), None);
    }

    #[tokio::test]
    async fn generate_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::new(dir.path().join("engine"));
        config.queue.workers = 5;
        config.sandbox.backend = Backend::Docker;
        config.ai.command = vec!["llm".into()];

        let path = generate(&config).await.unwrap();
        assert_eq!(path, dir.path().join("engine/runner.yaml"));

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }
}
