//! Priority task queue, a bounded worker pool that drains it with
//! demote-and-requeue retries, and a periodic scheduler feeding it.

mod error;
mod handler;
mod pool;
mod queue;
mod scheduler;
mod stats;
mod task;

#[cfg(test)]
mod test_support;

pub use error::{HandlerError, QueueError};
pub use handler::{TaskHandler, handler_fn};
pub use pool::{DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_WORKERS, DeadLetter, DeadLetterSink, PoolConfig, WorkerPool};
pub use queue::TaskQueue;
pub use scheduler::Scheduler;
pub use stats::QueueStats;
pub use task::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, Origin, Payload, Task, TaskId, TaskStatus};
