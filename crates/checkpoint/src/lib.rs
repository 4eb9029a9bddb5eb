//! Durable progress for long multi-step operations.
//!
//! [`CheckpointStore`] keeps one JSON file per operation. [`ResumableOperation`]
//! writes a checkpoint after every step so a restarted process continues
//! where the previous one stopped, and [`TransactionalOperation`] chains
//! several of them with reverse-order rollback.

mod error;
mod operation;
mod store;
mod transaction;

pub use error::{CheckpointError, CheckpointResult, OperationError, TransactionError};
pub use operation::{DEFAULT_COMPLETED_GRACE, OperationHandle, OperationOutcome, ResumableOperation};
pub use store::{Checkpoint, CheckpointMetadata, CheckpointStore, OperationStatus};
pub use transaction::TransactionalOperation;
