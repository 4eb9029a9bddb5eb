use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::task::{Payload, Task};

/// Processes tasks of one kind. Registered with a [`crate::WorkerPool`].
#[async_trait]
pub trait TaskHandler<P: Payload>: Send + Sync {
    async fn handle(&self, task: &Task<P>) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<P, F, Fut> TaskHandler<P> for FnHandler<F>
where
    P: Payload,
    F: Fn(Task<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, task: &Task<P>) -> Result<(), HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<P, F, Fut>(f: F) -> Arc<dyn TaskHandler<P>>
where
    P: Payload,
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
