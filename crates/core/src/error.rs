//! Error taxonomy shared by the sync crates.

use std::fmt;

/// Errors surfaced by a sync cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Unresolved target, missing credentials. Fatal before any mutation.
    #[error("configuration: {0}")]
    Config(String),
    /// Malformed spec file or diff segment; callers log and skip the item.
    #[error("parse: {context}: {message}")]
    Parse { context: String, message: String },
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("git: {0}")]
    Git(String),
    #[error("cipher: {0}")]
    Cipher(String),
    #[error("cluster: {0}")]
    Cluster(String),
    /// Reading or writing spec files in the working copy.
    #[error("spec store: {0}")]
    Store(String),
}

impl SyncError {
    pub fn parse(context: impl Into<String>, message: impl fmt::Display) -> Self {
        SyncError::Parse { context: context.into(), message: message.to_string() }
    }
}

/// Per-item failures collected across a batch; raised once every item was attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateError {
    pub context: String,
    pub failures: Vec<String>,
}

impl AggregateError {
    pub fn new(context: impl Into<String>) -> Self {
        Self { context: context.into(), failures: Vec::new() }
    }

    pub fn push(&mut self, failure: impl Into<String>) { self.failures.push(failure.into()); }

    pub fn is_empty(&self) -> bool { self.failures.is_empty() }

    pub fn len(&self) -> usize { self.failures.len() }

    /// `Ok(())` when nothing failed, otherwise the aggregate itself.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.failures.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.failures.len();
        write!(f, "{}: {} error{}: {}", self.context, n, if n == 1 { "" } else { "s" }, self.failures.join("; "))
    }
}

impl std::error::Error for AggregateError {}
