//! Backoff curves, cancelable contexts and a retry loop shared by the rest of
//! the engine.

mod backoff;
mod context;
mod retry;

pub use backoff::{BackoffPolicy, BackoffStrategy, compute};
pub use context::{Context, ContextError};
pub use retry::{Retry, RetryError, RetryPolicy, retry};
