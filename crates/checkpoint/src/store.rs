use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CheckpointError, CheckpointResult};

const EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Fresh,
    Resumed,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Persisted progress of one operation. One file per `operation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique per write.
    pub id: String,
    pub operation_id: String,
    pub step: u32,
    pub total_steps: u32,
    #[serde(default)]
    pub state: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub metadata: CheckpointMetadata,
}

/// Directory of checkpoint files.
///
/// Writes go to a uniquely named hidden temp file which is synced and then
/// renamed over the target, so readers only ever see complete files and
/// concurrent writers need no extra locking.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, operation_id: &str) -> CheckpointResult<PathBuf> {
        if !valid_id(operation_id) {
            return Err(CheckpointError::InvalidId(operation_id.to_string()));
        }
        Ok(self.dir.join(format!("{operation_id}.{EXTENSION}")))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let path = self.path_for(&checkpoint.operation_id)?;
        let json = serde_json::to_vec_pretty(checkpoint).map_err(CheckpointError::Encode)?;
        let tmp = self.dir.join(format!(
            ".{}.{}{TEMP_SUFFIX}",
            checkpoint.operation_id,
            Uuid::new_v4().simple()
        ));

        let result = write_then_rename(&tmp, &path, &json).await;
        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(&tmp).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %tmp.display(), error = %e, "failed to remove checkpoint temp file");
        }
        result?;

        debug!(
            operation_id = %checkpoint.operation_id,
            step = checkpoint.step,
            status = ?checkpoint.metadata.status,
            "checkpoint saved"
        );
        Ok(())
    }

    pub async fn load(&self, operation_id: &str) -> CheckpointResult<Checkpoint> {
        let path = self.path_for(operation_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(operation_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt {
            id: operation_id.to_string(),
            source,
        })
    }

    /// Removing a missing checkpoint is not an error.
    pub async fn delete(&self, operation_id: &str) -> CheckpointResult<()> {
        let path = self.path_for(operation_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(operation_id, "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable checkpoints, sorted by operation id. Unreadable or corrupt
    /// files are skipped with a warning.
    pub async fn list(&self) -> CheckpointResult<Vec<Checkpoint>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut checkpoints = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|id| valid_id(id))
            else {
                continue;
            };
            match self.load(id).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(operation_id = id, error = %e, "skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        Ok(checkpoints)
    }

    /// Delete completed or failed checkpoints last written before `cutoff`.
    /// Returns the deleted operation ids.
    pub async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> CheckpointResult<Vec<String>> {
        let mut deleted = Vec::new();
        for checkpoint in self.list().await? {
            if checkpoint.metadata.status.is_terminal() && checkpoint.timestamp < cutoff {
                self.delete(&checkpoint.operation_id).await?;
                deleted.push(checkpoint.operation_id);
            }
        }
        Ok(deleted)
    }

    /// Remove temp files left behind by writes that never reached the rename.
    pub async fn remove_temp_files(&self) -> CheckpointResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_temp = name
                .to_str()
                .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX));
            if !is_temp {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove temp file"),
            }
        }
        Ok(removed)
    }
}

async fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8]) -> CheckpointResult<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await?;
    Ok(())
}

/// Ids become file names: no separators, no leading dot.
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
