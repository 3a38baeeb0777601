//! Change extraction from `git diff --name-status` output.

use ksync_core::{ChangeKind, ChangeRecord};
use tracing::warn;

/// Arguments for a per-commit diff: single level, no copy/rename detection.
pub fn diff_args<'a>(parent: &'a str, commit: &'a str) -> [&'a str; 6] {
    ["diff", parent, commit, "--name-status", "-z", "--no-renames"]
}

/// Parse name-status output for one commit into change records sorted by path.
///
/// Accepts both the NUL-delimited (`-z`) form and the `<status>\t<path>` line form.
/// Paths are kept byte-for-byte, embedded spaces included. Rename/copy entries
/// (only seen when detection was not disabled) yield a delete of the old path
/// (renames only) and an apply of the new path.
pub fn parse_name_status(commit: &str, raw: &str) -> Vec<ChangeRecord> {
    if raw.chars().all(|c| c == '\0' || c.is_whitespace()) {
        return Vec::new();
    }
    let entries = if raw.contains('\0') { nul_entries(raw) } else { line_entries(raw) };
    let mut out = Vec::with_capacity(entries.len());
    for (status, paths) in entries {
        let code = status.chars().next().unwrap_or(' ');
        match (code, paths.as_slice()) {
            ('A' | 'M' | 'T', [path]) => out.push(record(commit, ChangeKind::Apply, path)),
            ('D', [path]) => out.push(record(commit, ChangeKind::Delete, path)),
            ('R', [old, new]) => {
                out.push(record(commit, ChangeKind::Delete, old));
                out.push(record(commit, ChangeKind::Apply, new));
            }
            ('C', [_, new]) => out.push(record(commit, ChangeKind::Apply, new)),
            _ => warn!(commit = %commit, status = %status, paths = ?paths, "skipping unparseable diff entry"),
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn record(commit: &str, kind: ChangeKind, path: &str) -> ChangeRecord {
    ChangeRecord { commit: commit.to_string(), kind, path: path.to_string() }
}

fn path_count(status: &str) -> usize {
    if status.starts_with('R') || status.starts_with('C') { 2 } else { 1 }
}

fn nul_entries(raw: &str) -> Vec<(String, Vec<String>)> {
    let mut tokens = raw.split('\0');
    let mut out = Vec::new();
    while let Some(status) = tokens.next() {
        let status = status.trim();
        if status.is_empty() { continue; }
        let paths: Vec<String> = tokens.by_ref().take(path_count(status)).map(|p| p.to_string()).collect();
        out.push((status.to_string(), paths));
    }
    out
}

fn line_entries(raw: &str) -> Vec<(String, Vec<String>)> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let mut fields = l.split('\t');
            let status = fields.next().unwrap_or_default().trim().to_string();
            (status, fields.map(|p| p.to_string()).collect())
        })
        .collect()
}
