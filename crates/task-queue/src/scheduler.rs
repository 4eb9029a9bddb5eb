use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::queue::TaskQueue;
use crate::task::{Payload, Task};

/// Enqueues recurring tasks through the same queue the workers drain.
pub struct Scheduler<P: Payload> {
    queue: Arc<TaskQueue<P>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<P: Payload> Scheduler<P> {
    pub fn new(queue: Arc<TaskQueue<P>>) -> Self {
        Self {
            queue,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Enqueue `make()` every `period`, first after one full period.
    /// Missed ticks are skipped rather than bunched up. A zero period
    /// disables the job.
    pub fn every<F>(&self, name: &str, period: Duration, make: F)
    where
        F: Fn() -> Task<P> + Send + Sync + 'static,
    {
        if period.is_zero() {
            info!(job = name, "periodic job disabled");
            return;
        }

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let name = name.to_string();
        info!(job = %name, period_secs = period.as_secs(), "periodic job scheduled");

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match queue.enqueue(make()) {
                            Ok(id) => debug!(job = %name, task_id = %id, "periodic task enqueued"),
                            Err(e) => warn!(job = %name, error = %e, "failed to enqueue periodic task"),
                        }
                    }
                }
            }
            debug!(job = %name, "periodic job stopped");
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
