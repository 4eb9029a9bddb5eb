use std::fmt;

use serde::Serialize;

use crate::task::Payload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Job {
    Work(u32),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Work,
    Other,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Work => "work",
            Self::Other => "other",
        })
    }
}

impl Payload for Job {
    type Kind = JobKind;

    fn kind(&self) -> JobKind {
        match self {
            Self::Work(_) => JobKind::Work,
            Self::Other => JobKind::Other,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Work(0) => Err("work item must be non-zero".into()),
            _ => Ok(()),
        }
    }
}
