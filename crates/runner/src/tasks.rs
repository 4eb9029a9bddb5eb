//! The closed set of task types the engine runs, and the producer-facing
//! request that becomes a queued [`Task`].

use std::fmt;

use serde::{Deserialize, Serialize};
use task_queue::{Origin, Payload, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IssueTriage,
    PrReview,
    ActionRun,
    AgentSession,
    Report,
    StaleSweep,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        Self::IssueTriage,
        Self::PrReview,
        Self::ActionRun,
        Self::AgentSession,
        Self::Report,
        Self::StaleSweep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IssueTriage => "issue_triage",
            Self::PrReview => "pr_review",
            Self::ActionRun => "action_run",
            Self::AgentSession => "agent_session",
            Self::Report => "report",
            Self::StaleSweep => "stale_sweep",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTriage {
    pub repo_id: String,
    pub issue_number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrReview {
    pub repo_id: String,
    pub pr_number: u64,
    #[serde(default)]
    pub title: String,
    /// Revisions compared as `base...head`.
    pub base: String,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRun {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    #[serde(default = "default_remote")]
    pub remote: String,
    pub branch: String,
}

fn default_remote() -> String {
    "origin".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub repo_id: String,
    /// Run in order, one checkpointed step each.
    pub commands: Vec<String>,
    /// Pushed as the final step when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushTarget>,
}

impl AgentSession {
    pub fn total_steps(&self) -> u32 {
        let steps = self.commands.len() + usize::from(self.push.is_some());
        u32::try_from(steps).unwrap_or(u32::MAX)
    }
}

/// Typed task body, tagged on the wire as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    IssueTriage(IssueTriage),
    PrReview(PrReview),
    ActionRun(ActionRun),
    AgentSession(AgentSession),
    Report,
    StaleSweep,
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} is required"))
    } else {
        Ok(())
    }
}

/// Ids that end up in sandbox names and store keys.
fn require_id(field: &str, value: &str) -> Result<(), String> {
    require(field, value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.len() <= 48;
    if valid {
        Ok(())
    } else {
        Err(format!(
            "{field} must be at most 48 characters of [A-Za-z0-9_.-] starting alphanumeric: {value:?}"
        ))
    }
}

impl Payload for TaskPayload {
    type Kind = TaskKind;

    fn kind(&self) -> TaskKind {
        match self {
            Self::IssueTriage(_) => TaskKind::IssueTriage,
            Self::PrReview(_) => TaskKind::PrReview,
            Self::ActionRun(_) => TaskKind::ActionRun,
            Self::AgentSession(_) => TaskKind::AgentSession,
            Self::Report => TaskKind::Report,
            Self::StaleSweep => TaskKind::StaleSweep,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::IssueTriage(p) => {
                require_id("repo_id", &p.repo_id)?;
                require("title", &p.title)?;
                if p.issue_number == 0 {
                    return Err("issue_number must be positive".into());
                }
                Ok(())
            }
            Self::PrReview(p) => {
                require_id("repo_id", &p.repo_id)?;
                require("base", &p.base)?;
                require("head", &p.head)?;
                for rev in [&p.base, &p.head] {
                    if rev.starts_with('-') {
                        return Err(format!("revision may not start with '-': {rev:?}"));
                    }
                }
                if p.pr_number == 0 {
                    return Err("pr_number must be positive".into());
                }
                Ok(())
            }
            Self::ActionRun(p) => require_id("action_id", &p.action_id),
            Self::AgentSession(p) => {
                require_id("session_id", &p.session_id)?;
                require_id("repo_id", &p.repo_id)?;
                if p.commands.is_empty() {
                    return Err("commands must not be empty".into());
                }
                if p.commands.iter().any(|c| c.trim().is_empty()) {
                    return Err("commands must not contain blank entries".into());
                }
                if let Some(push) = &p.push {
                    require("push.remote", &push.remote)?;
                    require("push.branch", &push.branch)?;
                }
                Ok(())
            }
            Self::Report | Self::StaleSweep => Ok(()),
        }
    }
}

/// What a producer submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Assigned by `submit` so the producer learns it up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub task: TaskPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    pub origin: Origin,
}

impl TaskRequest {
    pub fn new(task: TaskPayload) -> Self {
        Self {
            id: None,
            task,
            priority: None,
            max_retries: None,
            origin: Origin::default(),
        }
    }

    /// Validate and build the task. The request's id wins over a generated one.
    pub fn into_task(self) -> Result<Task<TaskPayload>, String> {
        self.task.validate()?;
        let mut task = Task::new(self.task).with_origin(self.origin);
        if let Some(priority) = self.priority {
            task = task.with_priority(priority);
        }
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        if let Some(id) = self.id {
            task = task.with_id(id);
        }
        Ok(task)
    }
}
