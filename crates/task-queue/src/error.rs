use crate::task::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid task {id}: {reason}")]
    Invalid { id: TaskId, reason: String },

    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("queue closed")]
    Closed,
}

/// Returned by task handlers. Only `Retryable` failures are re-enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
