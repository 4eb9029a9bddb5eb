use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{RunnerError, RunnerResult};

fn open(path: &Path) -> RunnerResult<std::fs::File> {
    std::fs::File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| RunnerError::Internal(format!("open lock {}: {e}", path.display())))
}

/// Acquire an exclusive flock on the given path, blocking until available.
///
/// The returned guard holds the lock until dropped.
pub async fn acquire(path: PathBuf) -> RunnerResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = open(&path)?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, e)| RunnerError::Internal(format!("flock {}: {e}", path.display())))
    })
    .await
    .map_err(|e| RunnerError::Internal(format!("lock task: {e}")))?
}

/// Like [`acquire`] but fails at once with `None` when another process holds
/// the lock.
pub async fn try_acquire(path: PathBuf) -> RunnerResult<Option<Flock<std::fs::File>>> {
    tokio::task::spawn_blocking(move || {
        let file = open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(lock)),
            Err((_file, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_file, e)) => Err(RunnerError::Internal(format!("flock {}: {e}", path.display()))),
        }
    })
    .await
    .map_err(|e| RunnerError::Internal(format!("lock task: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.lock");

        let guard = acquire(path.clone()).await.unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn held_lock_blocks_second_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.lock");

        let _guard = acquire(path.clone()).await.unwrap();
        assert!(try_acquire(path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.lock");

        let guard = acquire(path.clone()).await.unwrap();
        drop(guard);
        assert!(try_acquire(path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_path_returns_error() {
        let path = PathBuf::from("/nonexistent/dir/engine.lock");
        assert!(acquire(path.clone()).await.is_err());
        assert!(try_acquire(path).await.is_err());
    }
}
