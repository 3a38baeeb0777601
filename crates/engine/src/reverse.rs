//! Reverse sync writer: cluster objects back into spec files, one commit per batch.
//!
//! A batch is either all upserts or all deletes. Files are matched by resource
//! identity; unmatched upserts get a new file named by [`base_name`].

use std::path::{Path, PathBuf};

use ksync_cipher::SecretCipher;
use ksync_core::naming::base_name;
use ksync_core::{AppIdentity, ResourceIdentity, SyncAction, SyncError};
use ksync_git::{SpecRepo, GENERATED_MARKER};
use ksync_store::{match_by_identity, serialize, strip_noisy, SpecFileEntry, SpecFormat, NEW_SPEC_EXTENSION};
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReverseReport {
    /// Files created or overwritten, relative to the repository root.
    pub written: Vec<String>,
    pub removed: Vec<String>,
    /// Resources that carried no usable identity.
    pub ignored: usize,
    pub committed: bool,
}

/// Commit message for a reverse-sync batch.
pub fn commit_message(action: SyncAction, app: &AppIdentity) -> String {
    format!("{} {}\n\n{}", action.verb(), app, GENERATED_MARKER)
}

/// Write `resources` into `repo` per `action`, then commit and push if anything changed.
/// Commit and push failures are returned to the caller.
pub async fn sync(
    repo: &dyn SpecRepo,
    resources: &[Json],
    action: SyncAction,
    app: &AppIdentity,
    cipher: Option<&SecretCipher>,
) -> Result<ReverseReport, SyncError> {
    let root = repo.root();
    let mut entries = ksync_store::index(root).map_err(|e| SyncError::Store(format!("{:#}", e)))?;
    let mut report = ReverseReport::default();

    for raw in resources {
        let Some(id) = ResourceIdentity::from_object(raw) else {
            warn!("resource without apiVersion, kind or metadata.name; ignoring");
            report.ignored += 1;
            continue;
        };
        match action {
            SyncAction::Upsert => {
                let obj = prepare(raw, cipher)?;
                let rel = upsert(root, &mut entries, &id, obj).await?;
                debug!(resource = %id, file = %rel, "spec written");
                counter!("reverse_sync_files_written", 1u64);
                report.written.push(rel);
            }
            SyncAction::Delete => {
                let Some(pos) = position_of(&id, &entries) else {
                    debug!(resource = %id, "no spec file; nothing to delete");
                    continue;
                };
                let entry = entries.remove(pos);
                tokio::fs::remove_file(&entry.path).await.map_err(|e| SyncError::Store(format!("removing {}: {}", entry.path.display(), e)))?;
                report.removed.push(entry.file_name());
            }
        }
    }

    if !repo.is_dirty().await? {
        debug!(action = action.verb(), "working copy clean; nothing to commit");
        return Ok(report);
    }
    repo.commit_all(&commit_message(action, app), false).await?;
    repo.push().await?;
    counter!("reverse_sync_commits", 1u64);
    report.committed = true;
    info!(action = action.verb(), app = %app, written = report.written.len(), removed = report.removed.len(), "reverse sync committed");
    Ok(report)
}

/// Strip server noise and encrypt Secret payloads when a key is set.
fn prepare(raw: &Json, cipher: Option<&SecretCipher>) -> Result<Json, SyncError> {
    let mut obj = strip_noisy(raw.clone());
    if ksync_cipher::is_secret(&obj) {
        match cipher {
            Some(c) => c.encrypt_secret(&mut obj)?,
            None => warn!(name = ?obj.pointer("/metadata/name"), "writing Secret payload in clear (no cipher key)"),
        }
    }
    Ok(obj)
}

fn position_of(id: &ResourceIdentity, entries: &[SpecFileEntry]) -> Option<usize> {
    let found = match_by_identity(id, entries)?;
    entries.iter().position(|e| std::ptr::eq(e, found))
}

/// Overwrite the matching file or allocate a new one; returns the file name written.
async fn upsert(root: &Path, entries: &mut Vec<SpecFileEntry>, id: &ResourceIdentity, obj: Json) -> Result<String, SyncError> {
    if let Some(pos) = position_of(id, entries) {
        let entry = &mut entries[pos];
        write_spec(&entry.path, &obj, entry.format).await?;
        entry.object = obj;
        return Ok(entry.file_name());
    }
    let path = free_path(root, &base_name(id));
    write_spec(&path, &obj, SpecFormat::Json).await?;
    let entry = SpecFileEntry { path, format: SpecFormat::Json, object: obj };
    let name = entry.file_name();
    entries.push(entry);
    Ok(name)
}

/// First `<base>[-<suffix>].json` under `root` not taken by an unrelated file.
fn free_path(root: &Path, base: &str) -> PathBuf {
    let mut candidate = root.join(format!("{}.{}", base, NEW_SPEC_EXTENSION));
    while candidate.exists() {
        let suffix = Uuid::new_v4().simple().to_string();
        candidate = root.join(format!("{}-{}.{}", base, &suffix[..6], NEW_SPEC_EXTENSION));
    }
    candidate
}

async fn write_spec(path: &Path, obj: &Json, format: SpecFormat) -> Result<(), SyncError> {
    let text = serialize(obj, format).map_err(|e| SyncError::parse(path.display().to_string(), format!("{:#}", e)))?;
    tokio::fs::write(path, text).await.map_err(|e| SyncError::Store(format!("writing {}: {}", path.display(), e)))
}
