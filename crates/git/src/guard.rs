//! Commit-loop guard and sync cursor.
//!
//! Every commit the engine writes carries [`GENERATED_MARKER`]; the forward
//! cycle never reprocesses those. The cursor commit additionally carries a
//! `sync-commit` tag naming the last source commit that was fully applied.

use ksync_core::{ResolvedTarget, SyncError};
use serde::{Deserialize, Serialize};

/// Substring identifying tool-generated commits.
pub const GENERATED_MARKER: &str = "[ksync:generated]";

const CURSOR_PREFIX: &str = "[ksync:sync-commit=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    /// First parent; `None` for a root commit.
    pub parent: Option<String>,
    pub message: String,
}

impl CommitInfo {
    pub fn short(&self) -> &str { &self.sha[..self.sha.len().min(7)] }
}

/// A push as reported by the hosting provider or CI pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Oldest first.
    pub commits: Vec<CommitInfo>,
}

pub fn is_generated(message: &str) -> bool { message.contains(GENERATED_MARKER) }

pub fn cursor_tag(sha: &str) -> String { format!("{}{}]", CURSOR_PREFIX, sha) }

/// The synced commit named by a cursor tag in `message`, if any.
pub fn parse_cursor(message: &str) -> Option<&str> {
    let start = message.find(CURSOR_PREFIX)? + CURSOR_PREFIX.len();
    let rest = &message[start..];
    let end = rest.find(']')?;
    let sha = rest[..end].trim();
    if sha.is_empty() { None } else { Some(sha) }
}

/// Message for the empty commit recording that everything up to `sha` was applied.
pub fn cursor_message(sha: &str) -> String {
    format!("Sync cursor {}\n\n{} {}", &sha[..sha.len().min(7)], GENERATED_MARKER, cursor_tag(sha))
}

/// Whether `push` targets the configured sync repository and branch.
///
/// An unresolved target is a configuration error, never a silent mismatch.
pub fn is_sync_push(push: &PushEvent, target: Option<&ResolvedTarget>) -> Result<bool, SyncError> {
    let target = target.ok_or_else(|| SyncError::Config("sync target was not resolved to a remote reference".into()))?;
    Ok(push.provider == target.provider && push.owner == target.owner && push.repo == target.repo && push.branch == target.branch)
}

/// Commits of a push that forward sync must process, oldest first.
pub fn select_commits(push: &PushEvent) -> Vec<&CommitInfo> {
    push.commits.iter().filter(|c| !is_generated(&c.message)).collect()
}

/// Result of walking history back to the most recent cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorScan {
    /// Sha named by the most recent cursor tag; `None` when no cursor was seen.
    pub cursor: Option<String>,
    /// Unprocessed source commits, oldest first.
    pub pending: Vec<CommitInfo>,
}

/// Walk `newest_first` until the first cursor-tagged commit; keep what came after it.
pub fn scan_history(newest_first: &[CommitInfo]) -> CursorScan {
    let mut pending = Vec::new();
    let mut cursor = None;
    for c in newest_first {
        if let Some(sha) = parse_cursor(&c.message) {
            cursor = Some(sha.to_string());
            break;
        }
        if !is_generated(&c.message) {
            pending.push(c.clone());
        }
    }
    pending.reverse();
    CursorScan { cursor, pending }
}
