//! Cluster-driven reverse sync: watchers feed a coalescing queue that is
//! flushed into upsert and delete batches on a fixed tick.

use std::sync::Arc;
use std::time::Duration;

use ksync_core::{Coalescer, Delta, DeltaKind, SyncAction};
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::Engine;

fn queue_cap() -> usize {
    std::env::var("KSYNC_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// Split drained deltas into (upserts, deletes), keeping arrival order within each.
pub fn split_deltas(deltas: Vec<Delta>) -> (Vec<Json>, Vec<Json>) {
    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for d in deltas {
        match d.kind {
            DeltaKind::Applied => upserts.push(d.raw),
            DeltaKind::Deleted => deletes.push(d.raw),
        }
    }
    (upserts, deletes)
}

/// Run one reverse cycle per non-empty batch. Failures are logged; the deltas are not retried.
pub async fn flush(engine: &Engine, deltas: Vec<Delta>) {
    let (upserts, deletes) = split_deltas(deltas);
    for (batch, action) in [(upserts, SyncAction::Upsert), (deletes, SyncAction::Delete)] {
        if batch.is_empty() { continue; }
        match engine.reverse_cycle(&batch, action).await {
            Ok(r) => info!(action = action.verb(), resources = batch.len(), written = r.written.len(), removed = r.removed.len(), committed = r.committed, "reverse sync flushed"),
            Err(e) => error!(action = action.verb(), resources = batch.len(), error = %e, "reverse sync failed"),
        }
    }
}

/// Watch `gvks` (optionally within `namespace`) and write observed changes back every `every`.
pub async fn watch_cluster(engine: Arc<Engine>, gvks: Vec<String>, namespace: Option<String>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let cap = queue_cap();
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let mut handles = Vec::with_capacity(gvks.len());
    for gvk in gvks {
        let tx = tx.clone();
        let ns = namespace.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = ksync_kubehub::start_watcher(&gvk, ns.as_deref(), tx).await {
                error!(gvk = %gvk, error = ?e, "watcher failed");
            }
        }));
    }
    drop(tx);

    let mut queue = Coalescer::with_capacity(cap);
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(d) => queue.push(d),
                None => {
                    warn!("all watchers stopped");
                    break;
                }
            },
            _ = tick.tick() => {
                if queue.is_empty() { continue; }
                if queue.dropped() > 0 {
                    warn!(dropped = queue.dropped(), "delta queue overflowed; oldest changes were dropped");
                }
                flush(&engine, queue.drain_ready()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
        }
    }
    if !queue.is_empty() {
        flush(&engine, queue.drain_ready()).await;
    }
    for h in handles { h.abort(); }
    info!("cluster watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(n: u8, kind: DeltaKind, name: &str) -> Delta {
        Delta { uid: [n; 16], kind, raw: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "a"}}) }
    }

    #[test]
    fn batches_are_never_mixed() {
        let (up, del) = split_deltas(vec![
            delta(1, DeltaKind::Applied, "one"),
            delta(2, DeltaKind::Deleted, "two"),
            delta(3, DeltaKind::Applied, "three"),
        ]);
        let names = |v: &[Json]| v.iter().map(|o| o["metadata"]["name"].as_str().unwrap_or_default().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&up), vec!["one", "three"]);
        assert_eq!(names(&del), vec!["two"]);
    }

    #[test]
    fn coalesced_latest_state_wins() {
        let mut q = Coalescer::with_capacity(8);
        q.push(delta(1, DeltaKind::Applied, "x"));
        q.push(delta(1, DeltaKind::Deleted, "x"));
        let (up, del) = split_deltas(q.drain_ready());
        assert!(up.is_empty());
        assert_eq!(del.len(), 1);
    }
}
