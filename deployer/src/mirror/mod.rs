//! Lock-guarded operations on the local repository mirrors.
//!
//! Git needs minimal locking: most of its internal structures are immutable
//! and fetches are append-only. Because the mirrors are not bare repositories
//! two hazards remain, each guarded by its own advisory file lock:
//!
//! * concurrent fetches race on updating remote refs, so fetching takes the
//!   per-repo `fetch` lock (holders may also skip when it is taken — the
//!   other fetch will download the same objects anyway);
//! * checkouts mutate the working tree, so they take the per-repo `write`
//!   lock for the whole deployment.
//!
//! The two locks are disjoint: a fetch may overlap a checkout on the same
//! mirror, which is the common case when a push notification arrives during a
//! deployment.

pub mod filelock;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use slipway_common::filesystem_safe;

use crate::exec::{exec_cmd, CommandOutput, DEFAULT_TIMEOUT};
use filelock::{FileLock, LockError};

const LOCKS_FOLDER: &str = "deployerlocks";

#[derive(thiserror::Error, Debug)]
pub enum GitError {
    #[error("git {action} failed: {stderr}")]
    Command { action: String, stderr: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock task aborted")]
    Join(#[from] tokio::task::JoinError),
}

fn locks_dir() -> PathBuf {
    std::env::temp_dir().join(LOCKS_FOLDER)
}

fn lock_file(repo_path: &Path, kind: &str) -> Result<PathBuf, GitError> {
    let dir = locks_dir();
    std::fs::create_dir_all(&dir)?;
    let name = format!("{}_{}", filesystem_safe(&repo_path.to_string_lossy()), kind);
    Ok(dir.join(name))
}

async fn acquire_blocking(repo_path: &Path, kind: &str) -> Result<FileLock, GitError> {
    let path = lock_file(repo_path, kind)?;
    Ok(tokio::task::spawn_blocking(move || FileLock::acquire(&path)).await??)
}

fn check(action: &str, output: CommandOutput) -> Result<String, GitError> {
    if output.succeeded() {
        Ok(output.stdout)
    } else {
        Err(GitError::Command {
            action: action.to_owned(),
            stderr: output.stderr,
        })
    }
}

async fn git(repo_path: &Path, action: &str, args: &[&str]) -> Result<String, GitError> {
    let mut argv = vec![
        "git".to_owned(),
        "-C".to_owned(),
        repo_path.to_string_lossy().into_owned(),
    ];
    argv.extend(args.iter().map(|s| s.to_string()));
    check(action, exec_cmd(&argv, None, DEFAULT_TIMEOUT).await)
}

/// Clone URL for a repository. Servers given as full `ssh://` URLs are used
/// as-is; bare hostnames go through the scp-like syntax.
pub fn build_repo_url(repo_name: &str, git_server: &str) -> String {
    let ssh_url = Regex::new(r"^ssh://.*@.*:\d+").unwrap();
    if ssh_url.is_match(git_server) {
        format!("{}/{}", git_server.trim_end_matches('/'), repo_name)
    } else {
        format!("git@{git_server}:{repo_name}")
    }
}

fn is_repository(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Clone the repository if the mirror does not exist yet. Holds both locks
/// for the duration. Returns whether a clone was actually performed; an
/// already-present mirror is a success.
pub async fn ensure_cloned(remote_url: &str, local_path: &Path) -> Result<bool, GitError> {
    if is_repository(local_path) {
        return Ok(false);
    }

    let _fetch = acquire_blocking(local_path, "fetch").await?;
    let _write = acquire_blocking(local_path, "write").await?;
    if is_repository(local_path) {
        return Ok(false);
    }

    debug!(path = %local_path.display(), "cloning {remote_url}");
    let argv = vec![
        "git".to_owned(),
        "clone".to_owned(),
        remote_url.to_owned(),
        local_path.to_string_lossy().into_owned(),
    ];
    check("clone", exec_cmd(&argv, None, DEFAULT_TIMEOUT).await)?;
    Ok(true)
}

/// Holder of the per-repo `fetch` lock. Ref updates only, never the working
/// tree.
pub struct FetchScope {
    path: PathBuf,
    _lock: FileLock,
}

impl FetchScope {
    pub async fn acquire(repo_path: &Path) -> Result<Self, GitError> {
        let lock = acquire_blocking(repo_path, "fetch").await?;
        Ok(Self {
            path: repo_path.to_owned(),
            _lock: lock,
        })
    }

    /// Non-blocking variant. `None` when another fetch is already running.
    pub fn try_acquire(repo_path: &Path) -> Result<Option<Self>, GitError> {
        match FileLock::try_acquire(&lock_file(repo_path, "fetch")?) {
            Ok(lock) => Ok(Some(Self {
                path: repo_path.to_owned(),
                _lock: lock,
            })),
            Err(LockError::AlreadyLocked) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update all refs from origin.
    pub async fn fetch(&self) -> Result<(), GitError> {
        git(&self.path, "fetch", &["fetch", "origin"]).await?;
        Ok(())
    }
}

/// Holder of the per-repo `write` lock, allowing working-tree mutation.
pub struct WriteScope {
    path: PathBuf,
    _lock: FileLock,
}

impl WriteScope {
    pub async fn acquire(repo_path: &Path) -> Result<Self, GitError> {
        let lock = acquire_blocking(repo_path, "write").await?;
        Ok(Self {
            path: repo_path.to_owned(),
            _lock: lock,
        })
    }

    /// Make sure the given commit is checked out: drop untracked and ignored
    /// files, then hard-reset index and working tree.
    pub async fn switch_to(&self, commit: &str) -> Result<(), GitError> {
        // Twice the -f so nested repositories are deleted too.
        git(&self.path, "clean", &["clean", "-x", "-d", "-f", "-f"]).await?;
        git(&self.path, "reset", &["reset", "--hard", commit]).await?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub hexsha: String,
    pub committer: String,
    pub authored_date: DateTime<Utc>,
    pub message: String,
    pub deployable: bool,
}

/// Most recent commits of a remote branch. Read-only, needs no lock.
pub async fn list_commits(
    repo_path: &Path,
    branch: &str,
    count: usize,
) -> Result<Vec<Commit>, GitError> {
    let reference = if branch.starts_with("origin/") {
        branch.to_owned()
    } else {
        format!("origin/{branch}")
    };
    let output = git(
        repo_path,
        "log",
        &[
            "log",
            &reference,
            "-n",
            &count.to_string(),
            "--pretty=format:%H%x1f%cn%x1f%aI%x1f%s",
        ],
    )
    .await?;

    let mut commits = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\x1f').collect();
        if fields.len() != 4 {
            continue;
        }
        let authored_date = DateTime::parse_from_rfc3339(fields[2])
            .map_err(|e| GitError::Command {
                action: "log".into(),
                stderr: format!("bad author date '{}': {e}", fields[2]),
            })?
            .with_timezone(&Utc);
        commits.push(Commit {
            hexsha: fields[0].to_owned(),
            committer: fields[1].to_owned(),
            authored_date,
            message: fields[3].to_owned(),
            deployable: true,
        });
    }
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sh(dir: &Path, cmd: &str) {
        let status = std::process::Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "command failed: {cmd}");
    }

    fn init_origin(dir: &Path) {
        sh(
            dir,
            "git init -q -b main origin-repo \
             && cd origin-repo \
             && git -c user.name=t -c user.email=t@x commit -q --allow-empty -m first \
             && git -c user.name=t -c user.email=t@x commit -q --allow-empty -m second",
        );
    }

    #[test]
    fn repo_url_for_plain_and_ssh_servers() {
        assert_eq!(
            build_repo_url("org/app", "git.internal"),
            "git@git.internal:org/app"
        );
        assert_eq!(
            build_repo_url("org/app", "ssh://git@git.internal:7999/"),
            "ssh://git@git.internal:7999/org/app"
        );
    }

    #[tokio::test]
    async fn clone_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_origin(dir.path());
        let origin = dir.path().join("origin-repo");
        let mirror = dir.path().join("mirror");

        assert!(ensure_cloned(origin.to_str().unwrap(), &mirror).await.unwrap());
        assert!(!ensure_cloned(origin.to_str().unwrap(), &mirror).await.unwrap());
        assert!(mirror.join(".git").exists());
    }

    #[tokio::test]
    async fn fetch_lock_does_not_block_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("somerepo");

        let fetch = FetchScope::try_acquire(&repo).unwrap().unwrap();
        // An independent write scope can still be taken.
        let _write = WriteScope::acquire(&repo).await.unwrap();
        // But a second fetch scope cannot.
        assert!(FetchScope::try_acquire(&repo).unwrap().is_none());
        drop(fetch);
        assert!(FetchScope::try_acquire(&repo).unwrap().is_some());
    }

    #[tokio::test]
    async fn switch_to_and_list_commits() {
        let dir = tempfile::tempdir().unwrap();
        init_origin(dir.path());
        let origin = dir.path().join("origin-repo");
        let mirror = dir.path().join("mirror");
        ensure_cloned(origin.to_str().unwrap(), &mirror).await.unwrap();

        let commits = list_commits(&mirror, "main", 150).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "second");

        let write = WriteScope::acquire(&mirror).await.unwrap();
        // Leave junk behind; switch_to must clean it.
        std::fs::write(mirror.join("junk.txt"), "junk").unwrap();
        write.switch_to(&commits[1].hexsha).await.unwrap();
        assert!(!mirror.join("junk.txt").exists());

        let head = git(&mirror, "rev-parse", &["rev-parse", "HEAD"]).await.unwrap();
        assert_eq!(head.trim(), commits[1].hexsha);
    }
}
