//! ksync engine: one sync cycle at a time between a spec repository and a cluster.
//!
//! Forward cycles apply repository commits to the cluster, reverse cycles write
//! cluster objects back as spec files. Both directions take the same cycle lock.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ksync_apply::Applier;
use ksync_cipher::SecretCipher;
use ksync_core::{ResolvedTarget, SyncAction, SyncConfig, SyncError};
use ksync_git::{default_branch, PushEvent, SpecRepo, WorkingCopy};
use ksync_kubehub::ClusterApi;
use metrics::histogram;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

mod forward;
pub mod reverse;
pub mod watcher;

pub use reverse::ReverseReport;

/// Outcome of a forward or bootstrap pass that applied without failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardReport {
    /// Source commits processed, oldest first.
    pub commits: Vec<String>,
    pub applied: usize,
    pub deleted: usize,
    pub skipped: usize,
    /// True when the pass ran as a from-scratch bootstrap.
    pub bootstrap: bool,
    /// Sha recorded in the cursor commit, when one was pushed.
    pub cursor: Option<String>,
}

/// Resolve the branch (asking the remote for its default when unset) and the target coordinates.
pub async fn resolve_target(config: &SyncConfig) -> Result<ResolvedTarget, SyncError> {
    let branch = match &config.target.branch {
        Some(b) => b.clone(),
        None => default_branch(&config.target.url, config.credentials.as_ref()).await?,
    };
    config.target.resolve(&branch)
}

pub struct Engine {
    config: SyncConfig,
    target: ResolvedTarget,
    applier: Applier,
    cipher: Option<SecretCipher>,
    cycle: Mutex<()>,
}

impl Engine {
    /// Validate `config` and derive the cipher key once. No network access.
    pub fn new(config: SyncConfig, target: ResolvedTarget, cluster: Arc<dyn ClusterApi>) -> Result<Self, SyncError> {
        config.validate()?;
        let cipher = match &config.cipher_key {
            Some(k) => Some(SecretCipher::new(k.expose_secret())?),
            None => {
                warn!("no secret cipher key configured; Secret payloads are written to the repository in clear");
                None
            }
        };
        let applier = Applier::new(cluster, config.retry);
        Ok(Self { config, target, applier, cipher, cycle: Mutex::new(()) })
    }

    pub fn config(&self) -> &SyncConfig { &self.config }
    pub fn target(&self) -> &ResolvedTarget { &self.target }
    pub fn applier(&self) -> &Applier { &self.applier }

    /// Fresh shallow clone owned by the calling cycle; removed when dropped.
    pub async fn checkout(&self) -> Result<WorkingCopy, SyncError> {
        Ok(WorkingCopy::clone_target(&self.target, self.config.credentials.as_ref(), self.config.clone_depth).await?)
    }

    /// Cursor-driven forward pass over `repo`; bootstraps when no cursor is found.
    pub async fn forward(&self, repo: &dyn SpecRepo) -> Result<ForwardReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        timed("forward", forward::run_cursor(self, repo)).await
    }

    /// Apply every spec file in `repo` in naming order, then record a cursor.
    pub async fn bootstrap(&self, repo: &dyn SpecRepo) -> Result<ForwardReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        timed("bootstrap", forward::run_bootstrap(self, repo)).await
    }

    /// Forward pass for the commits of a reported push. Pushes to other
    /// repositories or branches return `Ok(None)`.
    pub async fn on_push(&self, repo: &dyn SpecRepo, push: &PushEvent) -> Result<Option<ForwardReport>, SyncError> {
        if !ksync_git::guard::is_sync_push(push, Some(&self.target))? {
            info!(repo = %push.repo, branch = %push.branch, "push is not for the sync target; ignoring");
            return Ok(None);
        }
        let _cycle = self.cycle.lock().await;
        timed("push", forward::run_push(self, repo, push)).await.map(Some)
    }

    /// Write `resources` back into `repo` as one commit.
    pub async fn reverse(&self, repo: &dyn SpecRepo, resources: &[Json], action: SyncAction) -> Result<ReverseReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        timed("reverse", reverse::sync(repo, resources, action, &self.config.app, self.cipher.as_ref())).await
    }

    // The *_cycle variants clone under the cycle lock so a queued cycle sees
    // whatever the previous one pushed.

    /// Clone, run a forward pass, discard the clone.
    pub async fn forward_cycle(&self) -> Result<ForwardReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        let repo = self.checkout().await?;
        timed("forward", forward::run_cursor(self, &repo)).await
    }

    pub async fn bootstrap_cycle(&self) -> Result<ForwardReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        let repo = self.checkout().await?;
        timed("bootstrap", forward::run_bootstrap(self, &repo)).await
    }

    /// Clone and run [`Engine::on_push`]; no clone is made for pushes to other targets.
    pub async fn push_cycle(&self, push: &PushEvent) -> Result<Option<ForwardReport>, SyncError> {
        if !ksync_git::guard::is_sync_push(push, Some(&self.target))? {
            info!(repo = %push.repo, branch = %push.branch, "push is not for the sync target; ignoring");
            return Ok(None);
        }
        let _cycle = self.cycle.lock().await;
        let repo = self.checkout().await?;
        timed("push", forward::run_push(self, &repo, push)).await.map(Some)
    }

    pub async fn reverse_cycle(&self, resources: &[Json], action: SyncAction) -> Result<ReverseReport, SyncError> {
        if resources.is_empty() {
            return Ok(ReverseReport::default());
        }
        let _cycle = self.cycle.lock().await;
        let repo = self.checkout().await?;
        timed("reverse", reverse::sync(&repo, resources, action, &self.config.app, self.cipher.as_ref())).await
    }

    /// Run forward cycles every `interval` until `shutdown` flips to true.
    /// A failed cycle is logged and the next tick tries again.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every_secs = interval.as_secs(), target = %self.target, "periodic forward sync started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.forward_cycle().await {
                        Ok(r) => info!(commits = r.commits.len(), applied = r.applied, deleted = r.deleted, bootstrap = r.bootstrap, "forward sync cycle done"),
                        Err(e) => error!(error = %e, "forward sync cycle failed; skipping"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
        info!("periodic forward sync stopped");
    }
}

async fn timed<T>(cycle: &'static str, fut: impl Future<Output = Result<T, SyncError>>) -> Result<T, SyncError> {
    let t0 = Instant::now();
    let res = fut.await;
    histogram!("sync_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0, "cycle" => cycle);
    res
}
