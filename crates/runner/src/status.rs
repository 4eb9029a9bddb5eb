use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sandbox::SandboxStatus;
use serde::{Deserialize, Serialize};
use task_queue::QueueStats;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::RunnerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Running,
    /// No new intake; in-flight and queued tasks finish.
    Draining,
    Stopping,
    Stopped,
}

/// Compact view of one sandbox in the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSummary {
    pub name: String,
    pub label: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl From<&SandboxStatus> for SandboxSummary {
    fn from(status: &SandboxStatus) -> Self {
        Self {
            name: status.name.clone(),
            label: status.label.clone(),
            state: status.state.to_string(),
            exit_code: status.exit_code,
        }
    }
}

/// Contents of `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub mode: EngineMode,
    pub pid: u32,
    pub queue: QueueStats,
    pub sandboxes: Vec<SandboxSummary>,
    #[serde(serialize_with = "serialize_iso")]
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    pub updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Read the status file written by a serving engine.
pub async fn read(path: &std::path::Path) -> RunnerResult<EngineStatus> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content)
        .map_err(|e| crate::error::RunnerError::Internal(format!("parse {}: {e}", path.display())))
}

/// Thread-safe status tracker that persists state to a JSON file atomically.
///
/// Share via `Arc<StatusTracker>`; immutable fields live outside the mutex.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: EngineMode,
    queue: QueueStats,
    sandboxes: Vec<SandboxSummary>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: EngineMode::Running,
                queue: QueueStats::default(),
                sandboxes: Vec::new(),
            }),
        }
    }

    pub async fn mode(&self) -> EngineMode {
        self.state.lock().await.mode
    }

    pub async fn set_mode(&self, mode: EngineMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    /// Refresh the counters and sandbox list.
    pub async fn update(&self, queue: QueueStats, sandboxes: &[SandboxStatus]) {
        let mut state = self.state.lock().await;
        state.queue = queue;
        state.sandboxes = sandboxes.iter().map(SandboxSummary::from).collect();
        self.write_status(&state).await;
    }

    /// Write the initial status file.
    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let status = EngineStatus {
            mode: state.mode,
            pid: std::process::id(),
            queue: state.queue.clone(),
            sandboxes: state.sandboxes.clone(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use sandbox::SandboxState;

    use super::*;

    fn read_status(path: &std::path::Path) -> serde_json::Value {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    fn sandbox(name: &str, state: SandboxState) -> SandboxStatus {
        SandboxStatus {
            name: name.into(),
            label: format!("{name} label"),
            state,
            running: state == SandboxState::Running,
            start_time: None,
            duration: None,
            exit_code: None,
            timed_out: false,
        }
    }

    #[tokio::test]
    async fn write_initial_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "running");
        assert_eq!(status["queue"]["queueLength"], 0);
        assert!(status["sandboxes"].as_array().unwrap().is_empty());
        assert!(status["started_at"].as_str().is_some());
        assert!(status["updated_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn set_mode_updates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;
        tracker.set_mode(EngineMode::Draining).await;

        assert_eq!(read_status(&path)["mode"], "draining");
        assert_eq!(tracker.mode().await, EngineMode::Draining);
    }

    #[tokio::test]
    async fn update_records_stats_and_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        let stats = QueueStats {
            queue_length: 4,
            total_processed: 7,
            ..QueueStats::default()
        };
        tracker
            .update(stats, &[sandbox("action-1", SandboxState::Running), sandbox("agent-s1", SandboxState::Stopped)])
            .await;

        let status = read(&path).await.unwrap();
        assert_eq!(status.queue.queue_length, 4);
        assert_eq!(status.queue.total_processed, 7);
        let names: Vec<_> = status.sandboxes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["action-1", "agent-s1"]);
        assert_eq!(status.sandboxes[0].state, "running");
    }

    #[tokio::test]
    async fn timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        let started = status["started_at"].as_str().unwrap();
        assert!(started.ends_with('Z'));
        assert!(started.contains('T'));
        assert_eq!(started.len(), 24); // "2026-02-10T12:34:56.789Z"
    }
}
