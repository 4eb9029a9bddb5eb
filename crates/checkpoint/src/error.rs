use retry::{ContextError, RetryError};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint {id} is corrupt: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid operation id: {0:?}")]
    InvalidId(String),

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Failure of a resumable operation or one of its steps.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{message}")]
    Step { message: String, retryable: bool },

    #[error("step {step} is past the last step ({total})")]
    InvalidStep { step: u32, total: u32 },
}

impl OperationError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Step {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Step {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether running the operation again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Step { retryable, .. } => *retryable,
            Self::Checkpoint(CheckpointError::Io(_)) | Self::Context(_) => true,
            Self::Checkpoint(_) | Self::InvalidStep { .. } => false,
        }
    }
}

impl From<RetryError<CheckpointError>> for OperationError {
    fn from(err: RetryError<CheckpointError>) -> Self {
        match err {
            RetryError::Interrupted {
                reason, last_error, ..
            } => last_error.map_or(Self::Context(reason), Self::Checkpoint),
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Self::Checkpoint(source)
            }
        }
    }
}

/// A stage of a [`crate::TransactionalOperation`] failed.
#[derive(Debug, thiserror::Error)]
#[error("stage {index} ({operation_id}) failed: {source}")]
pub struct TransactionError {
    pub index: usize,
    pub operation_id: String,
    #[source]
    pub source: OperationError,
}
