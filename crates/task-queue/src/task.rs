use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Typed task body. Decoded and validated once, before the task is queued.
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {
    /// Dispatch key for handler lookup.
    type Kind: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    /// Reject malformed payloads at enqueue time.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{kind}-{entity}-{unixtime}` for entity-bound tasks, `{kind}-{uuid}`
    /// otherwise.
    pub fn generate(kind: impl fmt::Display, entity_id: Option<&str>) -> Self {
        match entity_id {
            Some(entity) => Self(format!("{kind}-{entity}-{}", Utc::now().timestamp())),
            None => Self(format!("{kind}-{}", Uuid::new_v4())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Who asked for the task and what it is about. Opaque to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task<P> {
    pub id: TaskId,
    /// Lower runs first.
    pub priority: i32,
    pub payload: P,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl<P: Payload> Task<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: TaskId::generate(payload.kind(), None),
            priority: DEFAULT_PRIORITY,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: TaskStatus::Queued,
            origin: Origin::default(),
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Attach the origin; the id is regenerated from the entity if one is set.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        if origin.entity_id.is_some() {
            self.id = TaskId::generate(self.payload.kind(), origin.entity_id.as_deref());
        }
        self.origin = origin;
        self
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn kind(&self) -> P::Kind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Job;

    #[test]
    fn id_without_entity_is_kind_and_uuid() {
        let task = Task::new(Job::Work(1));
        let rest = task.id.as_str().strip_prefix("work-").unwrap();
        assert!(Uuid::parse_str(rest).is_ok());
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn id_with_entity_embeds_entity_and_time() {
        let task = Task::new(Job::Work(1)).with_origin(Origin {
            repo_id: Some("r1".into()),
            entity_type: Some("issue".into()),
            entity_id: Some("42".into()),
            ..Origin::default()
        });
        let parts: Vec<_> = task.id.as_str().splitn(3, '-').collect();
        assert_eq!(parts[0], "work");
        assert_eq!(parts[1], "42");
        assert!(parts[2].parse::<i64>().unwrap() > 1_600_000_000);
    }

    #[test]
    fn serializes_camel_case() {
        let task = Task::new(Job::Work(7)).with_priority(1);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["priority"], 1);
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["maxRetries"], 3);
        assert_eq!(value["status"], "queued");
        assert!(value.get("lastError").is_none());
    }
}
