//! File drop between `submit` and a serving engine.
//!
//! Each request is one JSON file named `{millis}-{uuid}.json`, so a sorted
//! directory listing is submission order. Files that cannot become tasks are
//! moved to `rejected/` next to a `.error` note.

use std::path::{Path, PathBuf};

use chrono::Utc;
use task_queue::{QueueError, TaskId, TaskQueue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RunnerError, RunnerResult};
use crate::paths::EnginePaths;
use crate::tasks::{TaskPayload, TaskRequest};

/// What one [`Spool::drain`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub enqueued: Vec<TaskId>,
    pub rejected: Vec<PathBuf>,
    /// Files left in place because the queue is full or closed.
    pub deferred: usize,
}

pub struct Spool {
    dir: PathBuf,
    rejected: PathBuf,
}

impl Spool {
    pub async fn open(paths: &EnginePaths) -> RunnerResult<Self> {
        let dir = paths.spool();
        let rejected = paths.rejected();
        tokio::fs::create_dir_all(&rejected).await?;
        Ok(Self { dir, rejected })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate `request`, fix its id and write it for the engine to pick up.
    pub async fn submit(&self, request: &TaskRequest) -> RunnerResult<TaskId> {
        let mut request = request.clone();
        let task = request.clone().into_task().map_err(RunnerError::InvalidRequest)?;
        request.id = Some(task.id.clone());

        let json = serde_json::to_vec_pretty(&request)
            .map_err(|e| RunnerError::Internal(format!("encode task request: {e}")))?;
        let name = format!("{:013}-{}.json", Utc::now().timestamp_millis(), Uuid::new_v4());
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.dir.join(&name)).await?;

        info!(task_id = %task.id, kind = %task.kind(), file = %name, "task submitted");
        Ok(task.id)
    }

    /// Spooled request files, oldest first.
    async fn pending(&self) -> RunnerResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Move every spooled request into `queue`. Stops early, leaving the rest
    /// on disk, when the queue refuses more work.
    pub async fn drain(&self, queue: &TaskQueue<TaskPayload>) -> RunnerResult<DrainReport> {
        let mut report = DrainReport::default();
        let files = self.pending().await?;
        let total = files.len();

        for (index, path) in files.into_iter().enumerate() {
            let task = match read_request(&path).await {
                Ok(request) => request.into_task(),
                Err(e) => Err(e),
            };
            let task = match task {
                Ok(task) => task,
                Err(reason) => {
                    self.reject(&path, &reason).await?;
                    report.rejected.push(path);
                    continue;
                }
            };

            match queue.enqueue(task) {
                Ok(id) => {
                    tokio::fs::remove_file(&path).await?;
                    debug!(task_id = %id, "spooled task enqueued");
                    report.enqueued.push(id);
                }
                Err(QueueError::Invalid { reason, .. }) => {
                    self.reject(&path, &reason).await?;
                    report.rejected.push(path);
                }
                Err(e @ (QueueError::QueueFull { .. } | QueueError::Closed)) => {
                    report.deferred = total - index;
                    debug!(error = %e, deferred = report.deferred, "queue refused spooled tasks");
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn reject(&self, path: &Path, reason: &str) -> RunnerResult<()> {
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let target = self.rejected.join(name);
        warn!(file = %path.display(), reason, "rejecting spooled task");
        tokio::fs::rename(path, &target).await?;
        tokio::fs::write(target.with_extension("error"), format!("{reason}\n")).await?;
        Ok(())
    }
}

async fn read_request(path: &Path) -> Result<TaskRequest, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| format!("read: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("decode: {e}"))
}
