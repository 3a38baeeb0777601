//! ksync git: change extraction, commit-loop guard and working copies over the `git` CLI.

#![forbid(unsafe_code)]

use std::path::Path;

use async_trait::async_trait;
use ksync_core::{ChangeRecord, SyncError};

pub mod diff;
pub mod guard;
mod repo;

pub use diff::parse_name_status;
pub use guard::{CommitInfo, CursorScan, PushEvent, GENERATED_MARKER};
pub use repo::{default_branch, WorkingCopy, EMPTY_TREE};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("working copy io: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {args} failed (exit {code:?}): {stderr}")]
    Failed { args: String, code: Option<i32>, stderr: String },
    #[error("commit {0} is not reachable in the fetched history")]
    MissingCommit(String),
    #[error("unexpected git output: {0}")]
    Unexpected(String),
}

impl From<GitError> for SyncError {
    fn from(e: GitError) -> Self { SyncError::Git(e.to_string()) }
}

/// The repository operations a sync cycle needs from its working copy.
#[async_trait]
pub trait SpecRepo: Send + Sync {
    /// Checkout root; spec files live directly under it.
    fn root(&self) -> &Path;

    /// First-parent history from HEAD, newest first, at most `limit` commits.
    async fn history(&self, limit: usize) -> Result<Vec<CommitInfo>, GitError>;

    /// Files touched by `commit` relative to its first parent, sorted by path.
    async fn changes(&self, commit: &CommitInfo) -> Result<Vec<ChangeRecord>, GitError>;

    /// Content of `path` as of `rev`.
    async fn show(&self, rev: &str, path: &str) -> Result<String, GitError>;

    async fn is_dirty(&self) -> Result<bool, GitError>;

    /// Stage everything and commit.
    async fn commit_all(&self, message: &str, allow_empty: bool) -> Result<(), GitError>;

    async fn push(&self) -> Result<(), GitError>;
}
