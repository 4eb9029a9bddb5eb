use std::future::Future;
use std::pin::Pin;

use retry::Context;
use tracing::{info, warn};

use crate::error::{OperationError, TransactionError};
use crate::operation::{OperationHandle, OperationOutcome, ResumableOperation};

type StageWork = Box<dyn FnOnce(OperationHandle) -> Pin<Box<dyn Future<Output = Result<(), OperationError>> + Send>> + Send>;

struct Stage {
    operation: ResumableOperation,
    work: StageWork,
}

/// Runs resumable operations in order. When one fails, the ones that already
/// completed are rolled back newest first.
pub struct TransactionalOperation {
    id: String,
    stages: Vec<Stage>,
}

impl TransactionalOperation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage<F, Fut>(mut self, operation: ResumableOperation, work: F) -> Self
    where
        F: FnOnce(OperationHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        self.stages.push(Stage {
            operation,
            work: Box::new(move |handle| Box::pin(work(handle))),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(self, ctx: &Context) -> Result<Vec<OperationOutcome>, TransactionError> {
        let mut completed: Vec<(ResumableOperation, OperationOutcome)> = Vec::with_capacity(self.stages.len());

        for (index, Stage { operation, work }) in self.stages.into_iter().enumerate() {
            match operation.run(ctx, work).await {
                Ok(outcome) => completed.push((operation, outcome)),
                Err(source) => {
                    warn!(
                        transaction = %self.id,
                        index,
                        operation_id = operation.id(),
                        error = %source,
                        "stage failed, unwinding"
                    );
                    for (done, outcome) in completed.iter().rev() {
                        if let Err(e) = done.rollback(outcome.step, outcome.state.clone()).await {
                            warn!(
                                transaction = %self.id,
                                operation_id = done.id(),
                                error = %e,
                                "rollback of completed stage failed"
                            );
                        }
                    }
                    return Err(TransactionError {
                        index,
                        operation_id: operation.id().to_string(),
                        source,
                    });
                }
            }
        }

        info!(transaction = %self.id, stages = completed.len(), "transaction completed");
        Ok(completed.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::store::CheckpointStore;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn logged(name: &'static str, id: &str, store: &Arc<CheckpointStore>, log: &Log) -> ResumableOperation {
        let log = Arc::clone(log);
        ResumableOperation::new(id, 1, Arc::clone(store)).with_rollback(move |_, _| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    async fn one_step(h: OperationHandle) -> Result<(), OperationError> {
        h.next_step().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failure_unwinds_completed_stages_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());
        let log: Log = Arc::default();

        let tx = TransactionalOperation::new("deploy")
            .stage(logged("A", "tx-a", &store, &log), one_step)
            .stage(logged("B", "tx-b", &store, &log), one_step)
            .stage(
                ResumableOperation::new("tx-c", 1, Arc::clone(&store)),
                |_| async { Err(OperationError::permanent("C exploded")) },
            );

        let err = tx.run(&Context::background()).await.unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.operation_id, "tx-c");
        assert_eq!(err.source.to_string(), "C exploded");
        assert_eq!(*log.lock().unwrap(), ["B", "A"]);
    }

    #[tokio::test]
    async fn rollback_failure_does_not_stop_unwind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());
        let log: Log = Arc::default();

        let broken = ResumableOperation::new("tx-broken", 1, Arc::clone(&store))
            .with_rollback(|_, _| async { Err(OperationError::permanent("cannot undo")) });

        let tx = TransactionalOperation::new("partial")
            .stage(logged("A", "tx2-a", &store, &log), one_step)
            .stage(broken, one_step)
            .stage(
                ResumableOperation::new("tx2-c", 1, Arc::clone(&store)),
                |_| async { Err(OperationError::retryable("flaky")) },
            );

        let err = tx.run(&Context::background()).await.unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(*log.lock().unwrap(), ["A"]);
    }

    #[tokio::test]
    async fn all_stages_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());
        let log: Log = Arc::default();

        let outcomes = TransactionalOperation::new("ok")
            .stage(logged("A", "tx3-a", &store, &log), one_step)
            .stage(logged("B", "tx3-b", &store, &log), one_step)
            .run(&Context::background())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }
}
