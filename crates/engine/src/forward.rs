//! Forward direction: repository commits to cluster.

use std::path::Path;

use ksync_apply::ApplyOutcome;
use ksync_core::naming::base_name;
use ksync_core::{AggregateError, ChangeKind, ChangeRecord, ResourceIdentity, SyncError};
use ksync_git::guard::{cursor_message, scan_history, select_commits};
use ksync_git::{CommitInfo, PushEvent, SpecRepo};
use ksync_store::{is_spec_path, load_spec, match_by_identity, parse_spec, SpecFileEntry, SpecFormat};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::{Engine, ForwardReport};

pub(crate) async fn run_cursor(engine: &Engine, repo: &dyn SpecRepo) -> Result<ForwardReport, SyncError> {
    let history = repo.history(engine.config.max_scan).await?;
    let scan = scan_history(&history);
    let Some(cursor) = scan.cursor else {
        info!(scanned = history.len(), "no sync cursor in recent history; bootstrapping");
        return run_bootstrap(engine, repo).await;
    };
    if scan.pending.is_empty() {
        debug!(cursor = %cursor, "nothing to sync since cursor");
        return Ok(ForwardReport::default());
    }
    info!(cursor = %cursor, pending = scan.pending.len(), "forward sync");
    let commits: Vec<&CommitInfo> = scan.pending.iter().collect();
    let (report, errors) = apply_commits(engine, repo, &commits).await?;
    finish(repo, report, errors).await
}

pub(crate) async fn run_push(engine: &Engine, repo: &dyn SpecRepo, push: &PushEvent) -> Result<ForwardReport, SyncError> {
    let selected = select_commits(push);
    if selected.is_empty() {
        debug!(commits = push.commits.len(), "push holds only generated commits");
        return Ok(ForwardReport::default());
    }
    // Push payloads may omit parents; take them from the checkout.
    let history = repo.history(engine.config.max_scan).await?;
    let mut commits: Vec<&CommitInfo> = Vec::with_capacity(selected.len());
    for c in selected {
        match history.iter().find(|h| h.sha == c.sha) {
            Some(h) => commits.push(h),
            None => return Err(ksync_git::GitError::MissingCommit(c.sha.clone()).into()),
        }
    }
    let (report, errors) = apply_commits(engine, repo, &commits).await?;
    errors.into_result()?;
    Ok(report)
}

pub(crate) async fn run_bootstrap(engine: &Engine, repo: &dyn SpecRepo) -> Result<ForwardReport, SyncError> {
    let entries = ksync_store::index(repo.root()).map_err(|e| SyncError::Store(format!("{:#}", e)))?;
    let mut errors = AggregateError::new("bootstrap failed");
    let mut ordered: Vec<(String, SpecFileEntry)> = Vec::with_capacity(entries.len());
    for e in entries {
        match e.identity() {
            Some(id) => ordered.push((base_name(&id), e)),
            None => errors.push(format!("{}: missing apiVersion, kind or metadata.name", e.file_name())),
        }
    }
    ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
    info!(files = ordered.len(), "bootstrapping cluster from spec store");

    let mut report = ForwardReport { bootstrap: true, ..Default::default() };
    for (_, entry) in ordered {
        let ctx = entry.file_name();
        match apply_object(engine, entry.object).await {
            Ok(true) => report.applied += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => errors.push(format!("{}: {}", ctx, e)),
        }
    }
    if let Some(head) = repo.history(1).await?.into_iter().next() {
        report.commits.push(head.sha);
    }
    finish(repo, report, errors).await
}

/// Push a cursor commit when everything applied, then raise collected failures.
async fn finish(repo: &dyn SpecRepo, mut report: ForwardReport, errors: AggregateError) -> Result<ForwardReport, SyncError> {
    if !errors.is_empty() {
        warn!(failures = errors.len(), "forward sync had failures; cursor not advanced");
        return Err(errors.into());
    }
    if let Some(last) = report.commits.last().cloned() {
        repo.commit_all(&cursor_message(&last), true).await?;
        repo.push().await?;
        info!(cursor = %last, applied = report.applied, deleted = report.deleted, "sync cursor advanced");
        report.cursor = Some(last);
    }
    Ok(report)
}

async fn apply_commits(engine: &Engine, repo: &dyn SpecRepo, commits: &[&CommitInfo]) -> Result<(ForwardReport, AggregateError), SyncError> {
    let mut report = ForwardReport::default();
    let mut errors = AggregateError::new("forward sync failed");
    for commit in commits {
        let records = repo.changes(commit).await?;
        for rec in records {
            if !is_spec_path(&rec.path) {
                debug!(path = %rec.path, commit = %commit.short(), "not a spec file; ignoring");
                continue;
            }
            counter!("forward_sync_records", 1u64);
            match apply_record(engine, repo, commit, &rec).await {
                Ok(Applied::Applied) => report.applied += 1,
                Ok(Applied::Deleted) => report.deleted += 1,
                Ok(Applied::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(commit = %commit.short(), path = %rec.path, error = %e, "change failed");
                    errors.push(format!("{} {}: {}", commit.short(), rec.path, e));
                }
            }
        }
        report.commits.push(commit.sha.clone());
    }
    Ok((report, errors))
}

enum Applied {
    Applied,
    Deleted,
    Skipped,
}

async fn apply_record(engine: &Engine, repo: &dyn SpecRepo, commit: &CommitInfo, rec: &ChangeRecord) -> Result<Applied, SyncError> {
    match rec.kind {
        ChangeKind::Apply => {
            let path = repo.root().join(&rec.path);
            if !path.exists() {
                // Removed by a later commit, which carries the delete.
                debug!(path = %rec.path, "file no longer present at HEAD; skipping apply");
                return Ok(Applied::Skipped);
            }
            let entry = match load_spec(&path) {
                Ok(entry) => entry,
                Err(e) => return Ok(unparseable(&rec.path, &e)),
            };
            Ok(if apply_object(engine, entry.object).await? { Applied::Applied } else { Applied::Skipped })
        }
        ChangeKind::Delete => {
            let parent = commit
                .parent
                .as_deref()
                .ok_or_else(|| SyncError::parse(&rec.path, "deleted in a root commit"))?;
            let format = SpecFormat::from_path(Path::new(&rec.path)).ok_or_else(|| SyncError::parse(&rec.path, "unknown spec format"))?;
            let text = repo.show(parent, &rec.path).await?;
            let before = match parse_spec(&text, format) {
                Ok(obj) => obj,
                Err(e) => return Ok(unparseable(&rec.path, &e)),
            };
            let id = identity_of(&before, &rec.path)?;
            // A rename within the store moves the file, not the resource.
            let head = ksync_store::index(repo.root()).map_err(|e| SyncError::Store(format!("{:#}", e)))?;
            if let Some(still) = match_by_identity(&id, &head) {
                debug!(resource = %id, file = %still.file_name(), "resource still declared at HEAD; not deleting");
                return Ok(Applied::Skipped);
            }
            match engine.applier.delete(&id).await? {
                Some(_) => Ok(Applied::Deleted),
                None => Ok(Applied::Skipped),
            }
        }
    }
}

/// Same treatment the indexer gives a bad file: count it, log it, move on.
fn unparseable(what: &str, err: &impl std::fmt::Display) -> Applied {
    counter!("spec_parse_err", 1u64);
    warn!(file = %what, error = %format!("{:#}", err), "skipping unparseable spec file");
    Applied::Skipped
}

/// Decrypt Secret payloads if a key is configured, then apply. `Ok(false)` when skipped.
async fn apply_object(engine: &Engine, mut obj: Json) -> Result<bool, SyncError> {
    if let Some(cipher) = &engine.cipher {
        if ksync_cipher::is_secret(&obj) {
            cipher.decrypt_secret(&mut obj)?;
        }
    }
    match engine.applier.apply(&obj).await? {
        ApplyOutcome::Created(_) | ApplyOutcome::Patched(_) => Ok(true),
        ApplyOutcome::Skipped(_) => Ok(false),
    }
}

fn identity_of(obj: &Json, path: &str) -> Result<ResourceIdentity, SyncError> {
    ResourceIdentity::from_object(obj).ok_or_else(|| SyncError::parse(path, "missing apiVersion, kind or metadata.name"))
}
