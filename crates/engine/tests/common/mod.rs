//! In-memory [`SpecRepo`]: a temp directory plus a linear commit log kept in memory.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ksync_core::{ChangeKind, ChangeRecord, ResolvedTarget, SyncConfig, SyncTarget};
use ksync_engine::Engine;
use ksync_git::{CommitInfo, GitError, SpecRepo};
use ksync_kubehub::mock::MemoryCluster;
use tempfile::TempDir;

type Tree = BTreeMap<String, String>;

struct Commit {
    info: CommitInfo,
    changes: Vec<ChangeRecord>,
    tree: Tree,
}

#[derive(Default)]
struct State {
    commits: Vec<Commit>,
    pushes: usize,
    fail_push: bool,
}

pub struct MemoryRepo {
    dir: TempDir,
    state: Mutex<State>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap(), state: Mutex::new(State::default()) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn write(&self, name: &str, content: &str) { std::fs::write(self.dir.path().join(name), content).unwrap(); }

    pub fn remove(&self, name: &str) { std::fs::remove_file(self.dir.path().join(name)).unwrap(); }

    pub fn read(&self, name: &str) -> String { std::fs::read_to_string(self.dir.path().join(name)).unwrap() }

    pub fn files(&self) -> Vec<String> { snapshot(self.dir.path()).into_keys().collect() }

    /// Commit the directory as it is now; returns the new sha.
    pub fn commit(&self, message: &str) -> String {
        let tree = snapshot(self.dir.path());
        let mut st = self.state();
        let prev = st.commits.last().map(|c| c.tree.clone()).unwrap_or_default();
        let parent = st.commits.last().map(|c| c.info.sha.clone());
        let sha = format!("{:040x}", st.commits.len() + 1);
        let mut changes = Vec::new();
        for (path, content) in &tree {
            if prev.get(path) != Some(content) {
                changes.push(ChangeRecord { commit: sha.clone(), kind: ChangeKind::Apply, path: path.clone() });
            }
        }
        for path in prev.keys().filter(|p| !tree.contains_key(*p)) {
            changes.push(ChangeRecord { commit: sha.clone(), kind: ChangeKind::Delete, path: path.clone() });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        st.commits.push(Commit { info: CommitInfo { sha: sha.clone(), parent, message: message.to_string() }, changes, tree });
        sha
    }

    pub fn messages(&self) -> Vec<String> { self.state().commits.iter().map(|c| c.info.message.clone()).collect() }

    pub fn head(&self) -> Option<CommitInfo> { self.state().commits.last().map(|c| c.info.clone()) }

    pub fn pushes(&self) -> usize { self.state().pushes }

    pub fn fail_pushes(&self) { self.state().fail_push = true; }
}

fn snapshot(root: &Path) -> Tree {
    let mut tree = Tree::new();
    for ent in std::fs::read_dir(root).unwrap() {
        let ent = ent.unwrap();
        if ent.file_type().unwrap().is_file() {
            tree.insert(ent.file_name().to_string_lossy().to_string(), std::fs::read_to_string(ent.path()).unwrap());
        }
    }
    tree
}

fn failed(args: &str, stderr: &str) -> GitError {
    GitError::Failed { args: args.to_string(), code: Some(1), stderr: stderr.to_string() }
}

#[async_trait]
impl SpecRepo for MemoryRepo {
    fn root(&self) -> &Path { self.dir.path() }

    async fn history(&self, limit: usize) -> Result<Vec<CommitInfo>, GitError> {
        Ok(self.state().commits.iter().rev().take(limit).map(|c| c.info.clone()).collect())
    }

    async fn changes(&self, commit: &CommitInfo) -> Result<Vec<ChangeRecord>, GitError> {
        self.state()
            .commits
            .iter()
            .find(|c| c.info.sha == commit.sha)
            .map(|c| c.changes.clone())
            .ok_or_else(|| GitError::MissingCommit(commit.sha.clone()))
    }

    async fn show(&self, rev: &str, path: &str) -> Result<String, GitError> {
        let st = self.state();
        let commit = st.commits.iter().find(|c| c.info.sha == rev).ok_or_else(|| GitError::MissingCommit(rev.to_string()))?;
        commit.tree.get(path).cloned().ok_or_else(|| failed("show", "path does not exist"))
    }

    async fn is_dirty(&self) -> Result<bool, GitError> {
        let head = self.state().commits.last().map(|c| c.tree.clone()).unwrap_or_default();
        Ok(snapshot(self.dir.path()) != head)
    }

    async fn commit_all(&self, message: &str, allow_empty: bool) -> Result<(), GitError> {
        if !allow_empty && !self.is_dirty().await? {
            return Err(failed("commit", "nothing to commit"));
        }
        self.commit(message);
        Ok(())
    }

    async fn push(&self) -> Result<(), GitError> {
        let mut st = self.state();
        if st.fail_push {
            return Err(failed("push", "remote rejected"));
        }
        st.pushes += 1;
        Ok(())
    }
}

pub fn target() -> ResolvedTarget {
    SyncTarget { url: "https://github.com/acme/specs.git".into(), branch: Some("main".into()) }.resolve("main").unwrap()
}

pub fn config(cipher_key: Option<&str>) -> SyncConfig {
    let mut cfg = SyncConfig::new(SyncTarget { url: "https://github.com/acme/specs.git".into(), branch: Some("main".into()) });
    cfg.cipher_key = cipher_key.map(|k| secrecy::SecretString::new(k.to_string()));
    cfg.app = ksync_core::AppIdentity { namespace: Some("prod".into()), name: "web".into() };
    cfg
}

pub fn engine(cluster: &Arc<MemoryCluster>, cipher_key: Option<&str>) -> Engine {
    Engine::new(config(cipher_key), target(), cluster.clone()).unwrap()
}
