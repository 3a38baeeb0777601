//! ksync core types: resource identity, change records, deltas and the coalescer.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod config;
pub mod error;
pub mod naming;

pub use config::{AppIdentity, Credentials, ResolvedTarget, RetryPolicy, SyncConfig, SyncTarget};
pub use error::{AggregateError, SyncError};

/// Name used in generated commit markers and field managers.
pub const TOOL_NAME: &str = "ksync";

/// The `(apiVersion, kind, namespace, name)` join key between cluster objects and spec files.
///
/// An absent namespace only equals another absent namespace; it is never a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Read the identity fields of a raw object. Returns `None` when apiVersion, kind or name is missing.
    pub fn from_object(obj: &Json) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?;
        let kind = obj.get("kind")?.as_str()?;
        let meta = obj.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());
        Some(Self::new(api_version, kind, namespace, name))
    }

    /// Split apiVersion into `(group, version)`; the core group is the empty string.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn is_namespaced(&self) -> bool { self.namespace.is_some() }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Apply,
    Delete,
}

/// One file touched by one commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub commit: String,
    pub kind: ChangeKind,
    pub path: String,
}

/// Reverse-sync batch action. Batches never mix actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upsert,
    Delete,
}

impl SyncAction {
    /// Verb used in generated commit messages.
    pub fn verb(&self) -> &'static str {
        match self {
            SyncAction::Upsert => "Update",
            SyncAction::Delete => "Delete",
        }
    }
}

pub type Uid = [u8; 16];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A cluster-observed change to one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub uid: Uid,
    pub kind: DeltaKind,
    pub raw: Json,
}

/// Coalescing queue keyed by UID with FIFO order and fixed capacity.
/// The latest delta for a UID wins; the oldest UID is dropped on overflow.
pub struct Coalescer {
    map: FxHashMap<Uid, Delta>,
    order: VecDeque<Uid>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta) {
        let uid = d.uid;
        if !self.map.contains_key(&uid) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(uid);
        }
        self.map.insert(uid, d);
    }

    /// Drain everything in arrival order of first sighting.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&uid) {
                out.push(d);
            }
        }
        out
    }
}

pub mod prelude {
    pub use super::{ChangeKind, ChangeRecord, Delta, DeltaKind, ResourceIdentity, SyncAction, Uid};
    pub use super::naming::base_name;
}
