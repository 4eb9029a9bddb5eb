//! Repository lookup and the `git` plumbing the handlers shell out to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("git {command}: {message}")]
    Git {
        command: String,
        failure: GitFailure,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { failure, .. } => failure.is_retryable(),
            Self::Io(_) => true,
            Self::NotFound(_) => false,
        }
    }
}

/// Resolves a repo id to a path on this host.
#[async_trait]
pub trait Repositories: Send + Sync {
    async fn path(&self, repo_id: &str) -> Result<PathBuf, RepoError>;
}

/// Repositories laid out as `<root>/<id>` or `<root>/<id>.git`.
pub struct DirRepositories {
    root: PathBuf,
}

impl DirRepositories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Repositories for DirRepositories {
    async fn path(&self, repo_id: &str) -> Result<PathBuf, RepoError> {
        if repo_id.is_empty() || repo_id.contains(['/', '\\']) || repo_id.starts_with('.') {
            return Err(RepoError::NotFound(repo_id.to_string()));
        }
        for candidate in [self.root.join(repo_id), self.root.join(format!("{repo_id}.git"))] {
            if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_dir()) {
                return Ok(candidate);
            }
        }
        Err(RepoError::NotFound(repo_id.to_string()))
    }
}

/// Why a git command failed, as far as its stderr tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFailure {
    /// Credentials missing or refused.
    Auth,
    /// Repository, ref or revision does not exist.
    NotFound,
    /// The remote refused the update (non-fast-forward, hooks, protection).
    Rejected,
    /// Merge or rebase conflict in the working tree.
    Conflict,
    /// DNS, connection or transfer trouble.
    Network,
    Other,
}

impl GitFailure {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network)
    }
}

/// Classify git's stderr. This is the only place that inspects git error
/// text; everything else branches on [`GitFailure`].
pub fn classify_git_failure(stderr: &str) -> GitFailure {
    let text = stderr.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&[
        "authentication failed",
        "permission denied",
        "could not read username",
        "invalid username or password",
        "403",
    ]) {
        GitFailure::Auth
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "network is unreachable",
        "early eof",
        "the remote end hung up unexpectedly",
        "rpc failed",
    ]) {
        GitFailure::Network
    } else if any(&["[rejected]", "non-fast-forward", "failed to push some refs", "pre-receive hook declined"]) {
        GitFailure::Rejected
    } else if any(&["conflict", "needs merge", "unmerged files"]) {
        GitFailure::Conflict
    } else if any(&[
        "not a git repository",
        "does not appear to be a git repository",
        "repository not found",
        "unknown revision",
        "bad revision",
        "couldn't find remote ref",
        "invalid object name",
    ]) {
        GitFailure::NotFound
    } else {
        GitFailure::Other
    }
}

/// Run `git -C dir args...` and return stdout. A non-zero exit is classified.
pub async fn git(dir: &Path, args: &[&str]) -> Result<String, RepoError> {
    let command = args.join(" ");
    debug!(dir = %dir.display(), %command, "git");
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(RepoError::Git {
        command,
        failure: classify_git_failure(&stderr),
        message: stderr,
    })
}

/// Unified diff between two revisions of a repository.
pub async fn diff(repo: &Path, base: &str, head: &str) -> Result<String, RepoError> {
    let range = format!("{base}...{head}");
    git(repo, &["diff", "--no-color", "--no-ext-diff", &range, "--"]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_git_errors() {
        let cases = [
            ("fatal: Authentication failed for 'https://git.example/app.git/'", GitFailure::Auth),
            ("fatal: unable to access '...': Could not resolve host: git.example", GitFailure::Network),
            (
                " ! [rejected]        main -> main (non-fast-forward)\nerror: failed to push some refs",
                GitFailure::Rejected,
            ),
            ("CONFLICT (content): Merge conflict in src/lib.rs", GitFailure::Conflict),
            ("fatal: bad revision 'nope...main'", GitFailure::NotFound),
            ("fatal: the remote end hung up unexpectedly", GitFailure::Network),
            ("error: something unexpected", GitFailure::Other),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify_git_failure(stderr), expected, "{stderr}");
        }
    }

    #[test]
    fn only_network_failures_retry() {
        assert!(GitFailure::Network.is_retryable());
        for failure in [GitFailure::Auth, GitFailure::Rejected, GitFailure::Conflict, GitFailure::NotFound, GitFailure::Other] {
            assert!(!failure.is_retryable(), "{failure:?}");
        }
    }

    #[tokio::test]
    async fn resolves_plain_and_bare_layouts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::create_dir(dir.path().join("lib.git")).unwrap();
        std::fs::write(dir.path().join("file"), "").unwrap();
        let repos = DirRepositories::new(dir.path());

        assert_eq!(repos.path("app").await.unwrap(), dir.path().join("app"));
        assert_eq!(repos.path("lib").await.unwrap(), dir.path().join("lib.git"));
        for missing in ["nope", "file", "../app", ""] {
            assert!(matches!(repos.path(missing).await, Err(RepoError::NotFound(_))), "{missing}");
        }
    }

    #[tokio::test]
    async fn git_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let err = git(dir.path(), &["log"]).await.unwrap_err();
        match err {
            RepoError::Git { failure, .. } => assert_eq!(failure, GitFailure::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn diff_between_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        let sh = |script: &str| {
            let status = std::process::Command::new("bash")
                .args(["-c", script])
                .current_dir(repo)
                .status()
                .unwrap();
            assert!(status.success(), "{script}");
        };
        sh("git init -q -b main . && git config user.email t@example.com && git config user.name t");
        sh("echo one > f.txt && git add f.txt && git commit -q -m one");
        sh("git checkout -q -b feature && echo two >> f.txt && git commit -q -am two");

        let patch = diff(repo, "main", "feature").await.unwrap();
        assert!(patch.contains("+two"), "{patch}");
    }
}
