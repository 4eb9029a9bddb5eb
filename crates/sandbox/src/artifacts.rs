use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSetBuilder};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

/// A file found by [`collect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Relative to the workspace, `/`-separated.
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub size: u64,
}

/// Resolve artifact patterns against `workspace`.
///
/// Each pattern is an exact relative path, a directory ending in `/`
/// (collected recursively) or a glob (`*` stays within one directory, `**`
/// crosses directories). Missing paths are skipped. Patterns that are
/// absolute or climb out with `..` are skipped with a warning. Symlinks are
/// never followed.
pub async fn collect(workspace: &Path, patterns: &[String]) -> Result<Vec<Artifact>> {
    let workspace = workspace.to_path_buf();
    let patterns = patterns.to_vec();
    tokio::task::spawn_blocking(move || collect_blocking(&workspace, &patterns))
        .await
        .map_err(|e| SandboxError::Host(format!("artifact scan task: {e}")))?
}

fn collect_blocking(workspace: &Path, patterns: &[String]) -> Result<Vec<Artifact>> {
    let mut found = BTreeMap::new();
    let mut globs = GlobSetBuilder::new();
    let mut glob_count = 0;

    for raw in patterns {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }
        let Some(relative) = confine(pattern) else {
            warn!(pattern, "artifact pattern escapes the workspace, skipped");
            continue;
        };

        if is_glob(pattern) {
            match GlobBuilder::new(&relative.to_string_lossy())
                .literal_separator(true)
                .build()
            {
                Ok(glob) => {
                    globs.add(glob);
                    glob_count += 1;
                }
                Err(e) => warn!(pattern, error = %e, "invalid artifact glob, skipped"),
            }
            continue;
        }

        let target = workspace.join(&relative);
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => walk(workspace, &target, &mut |artifact| {
                found.insert(artifact.relative_path.clone(), artifact);
            })?,
            Ok(meta) if meta.is_file() => {
                found.insert(
                    relative.clone(),
                    Artifact {
                        relative_path: relative,
                        path: target,
                        size: meta.len(),
                    },
                );
            }
            Ok(_) => debug!(pattern, "artifact is not a regular file, skipped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(pattern, "artifact not found, skipped");
            }
            Err(e) => warn!(pattern, error = %e, "cannot read artifact, skipped"),
        }
    }

    if glob_count > 0 {
        let set = globs
            .build()
            .map_err(|e| SandboxError::InvalidConfig(format!("artifact globs: {e}")))?;
        walk(workspace, workspace, &mut |artifact| {
            if set.is_match(&artifact.relative_path) {
                found.insert(artifact.relative_path.clone(), artifact);
            }
        })?;
    }

    Ok(found.into_values().collect())
}

/// Relative, normalized form of `pattern`, or `None` if it would leave the
/// workspace.
fn confine(pattern: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(pattern).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Visit every regular file under `dir`.
fn walk(workspace: &Path, dir: &Path, visit: &mut dyn FnMut(Artifact)) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat, skipped");
                continue;
            }
        };
        if meta.is_dir() {
            walk(workspace, &path, visit)?;
        } else if meta.is_file()
            && let Ok(relative) = path.strip_prefix(workspace)
        {
            visit(Artifact {
                relative_path: relative.to_path_buf(),
                path: path.clone(),
                size: meta.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("dist/nested")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("report.xml"), "<ok/>").unwrap();
        fs::write(root.join("dist/app.bin"), "binary").unwrap();
        fs::write(root.join("dist/nested/lib.so"), "lib").unwrap();
        fs::write(root.join("logs/a.log"), "a").unwrap();
        fs::write(root.join("logs/b.log"), "bb").unwrap();
        fs::write(root.join("top.log"), "top").unwrap();
        dir
    }

    fn names(artifacts: &[Artifact]) -> Vec<String> {
        artifacts
            .iter()
            .map(|a| a.relative_path.to_string_lossy().into_owned())
            .collect()
    }

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn existing_missing_and_glob() {
        let dir = tree();
        let found = collect(dir.path(), &patterns(&["report.xml", "missing.txt", "logs/*.log"]))
            .await
            .unwrap();
        assert_eq!(names(&found), ["logs/a.log", "logs/b.log", "report.xml"]);
        assert_eq!(found[1].size, 2);
    }

    #[tokio::test]
    async fn trailing_slash_collects_directory_recursively() {
        let dir = tree();
        let found = collect(dir.path(), &patterns(&["dist/"])).await.unwrap();
        assert_eq!(names(&found), ["dist/app.bin", "dist/nested/lib.so"]);
    }

    #[tokio::test]
    async fn single_star_stays_in_one_directory() {
        let dir = tree();
        let found = collect(dir.path(), &patterns(&["*.log"])).await.unwrap();
        assert_eq!(names(&found), ["top.log"]);

        let found = collect(dir.path(), &patterns(&["**/*.log"])).await.unwrap();
        assert_eq!(names(&found), ["logs/a.log", "logs/b.log", "top.log"]);
    }

    #[tokio::test]
    async fn escaping_patterns_are_ignored() {
        let dir = tree();
        let found = collect(
            dir.path(),
            &patterns(&["../etc/passwd", "/etc/passwd", "./report.xml"]),
        )
        .await
        .unwrap();
        assert_eq!(names(&found), ["report.xml"]);
    }

    #[tokio::test]
    async fn overlapping_patterns_are_deduplicated() {
        let dir = tree();
        let found = collect(dir.path(), &patterns(&["logs/", "logs/a.log", "**/a.log"]))
            .await
            .unwrap();
        assert_eq!(names(&found), ["logs/a.log", "logs/b.log"]);
    }

    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = tree();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("leak")).unwrap();

        let found = collect(dir.path(), &patterns(&["link/", "leak", "**/secret"]))
            .await
            .unwrap();
        assert!(found.is_empty(), "{:?}", names(&found));
    }
}
