use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use task_queue::{Origin, QueueStats};

use crate::store::Record;

/// A CI job definition: a script run against a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub repo_id: String,
    pub name: String,
    pub script: String,
    /// Falls back to the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Glob patterns relative to the workspace.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record for Action {
    const COLLECTION: &'static str = "actions";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    TimedOut,
    /// The engine could not run the job at all.
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// One execution of an [`Action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub action_id: String,
    pub repo_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Tail of the combined output.
    #[serde(default)]
    pub output: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Record for Run {
    const COLLECTION: &'static str = "runs";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Run {
    pub fn pending(id: String, action: &Action) -> Self {
        Self {
            id,
            action_id: action.id.clone(),
            repo_id: action.repo_id.clone(),
            status: RunStatus::Pending,
            task_id: None,
            commit: None,
            sandbox: None,
            exit_code: None,
            reason: None,
            output: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }
}

/// A file kept from a run's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub run_id: String,
    /// Path inside the workspace.
    pub path: String,
    /// Where the copy lives under the artifacts directory.
    pub stored_at: String,
    pub size: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl Record for ArtifactRecord {
    const COLLECTION: &'static str = "artifacts";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A task that exhausted its retries or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub origin: Origin,
    pub failed_at: DateTime<Utc>,
}

impl Record for DeadLetterRecord {
    const COLLECTION: &'static str = "dead_letters";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Periodic snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub stats: QueueStats,
    pub sandboxes: usize,
    pub created_at: DateTime<Utc>,
}

impl Record for Report {
    const COLLECTION: &'static str = "reports";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiResultKind {
    Triage,
    Review,
}

/// What the model said about an issue or pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResult {
    pub id: String,
    pub kind: AiResultKind,
    pub repo_id: String,
    pub number: u64,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

impl Record for AiResult {
    const COLLECTION: &'static str = "ai_results";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// Progress of an agent session, mirrored from its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub repo_id: String,
    pub status: SessionStatus,
    pub steps_completed: u32,
    pub total_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Record for SessionRecord {
    const COLLECTION: &'static str = "sessions";

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(RunStatus::TimedOut).unwrap(), json!("timed_out"));
        assert!(RunStatus::TimedOut.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn action_reads_minimal_document() {
        let action: Action = serde_json::from_value(json!({
            "id": "build",
            "repo_id": "app",
            "name": "Build",
            "script": "make",
        }))
        .unwrap();
        assert!(action.artifacts.is_empty());
        assert_eq!(action.timeout_secs, None);
        assert_eq!(action.last_status, None);
    }
}
