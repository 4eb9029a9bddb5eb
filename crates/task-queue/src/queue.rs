use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueueError;
use crate::task::{Payload, Task, TaskId, TaskStatus};

struct Entry<P> {
    priority: i32,
    seq: u64,
    task: Task<P>,
}

// BinaryHeap is a max-heap: the entry that should pop first compares greatest.
impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<P> Eq for Entry<P> {}

struct Inner<P> {
    heap: BinaryHeap<Entry<P>>,
    next_seq: u64,
    /// Popped but not yet reported through `task_done`.
    in_flight: usize,
    closed: bool,
}

/// In-memory priority queue: lowest priority value first, FIFO among equals.
///
/// The lock guards only the heap; nothing awaits while holding it.
pub struct TaskQueue<P> {
    inner: Mutex<Inner<P>>,
    notify: Notify,
    capacity: Option<usize>,
}

impl<P: Payload> TaskQueue<P> {
    /// `capacity` bounds [`enqueue`](Self::enqueue); `None` is unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                in_flight: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Validate and insert a new task.
    pub fn enqueue(&self, task: Task<P>) -> Result<TaskId, QueueError> {
        if let Err(reason) = task.payload.validate() {
            return Err(QueueError::Invalid {
                id: task.id,
                reason,
            });
        }
        self.push(task, true)
    }

    /// Put a task that already passed through the queue back in. Not subject
    /// to the capacity bound, so a full queue never loses a retry.
    pub(crate) fn requeue(&self, task: Task<P>) -> Result<TaskId, QueueError> {
        self.push(task, false)
    }

    fn push(&self, mut task: Task<P>, bounded: bool) -> Result<TaskId, QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if bounded
            && let Some(capacity) = self.capacity
            && inner.heap.len() >= capacity
        {
            return Err(QueueError::QueueFull { capacity });
        }

        task.status = TaskStatus::Queued;
        let id = task.id.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority: task.priority,
            seq,
            task,
        });
        let len = inner.heap.len();
        drop(inner);

        debug!(task_id = %id, queue_length = len, "task queued");
        self.notify.notify_one();
        Ok(id)
    }

    pub fn try_pop(&self) -> Option<Task<P>> {
        let mut inner = self.lock();
        let entry = inner.heap.pop()?;
        inner.in_flight += 1;
        Some(entry.task)
    }

    /// Mark a popped task as finished, whatever its outcome.
    pub fn task_done(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Empty, and every popped task has been reported done.
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.heap.is_empty() && inner.in_flight == 0
    }

    /// Wait for the next task. `None` once `cancel` fires, or once the queue
    /// is closed and empty.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Task<P>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }
            {
                let mut inner = self.lock();
                if let Some(entry) = inner.heap.pop() {
                    inner.in_flight += 1;
                    let more = !inner.heap.is_empty();
                    drop(inner);
                    // Pass the wakeup on if other tasks are still waiting.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(entry.task);
                }
                if inner.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Reject further enqueues. Queued tasks can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}
