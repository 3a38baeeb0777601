//! ksync apply: create-or-patch, idempotent delete and bounded retry against a [`ClusterApi`].
//!
//! Calls run one at a time; apply order is the caller's order.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use ksync_core::{AggregateError, ResourceIdentity, RetryPolicy};
use ksync_kubehub::{patch_style_for, ClusterApi, ClusterError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(Json),
    Patched(Json),
    /// Preconditions for the kind were not met; nothing was sent.
    Skipped(String),
}

/// Run `op`, retrying transient failures up to `policy.attempts` total attempts.
/// Anything else (not-found, rejections) returns immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                counter!("apply_retry_total", 1u64);
                warn!(op = %what, attempt, max = policy.attempts, delay_ms = delay.as_millis() as u64, error = %e, "transient cluster failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(op = %what, attempts = attempt, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Why an object should not be sent at all, if anything.
///
/// An Ingress without any routing path or default backend has nothing to route.
pub fn precondition_unmet(obj: &Json) -> Option<String> {
    if obj.get("kind").and_then(|k| k.as_str()) != Some("Ingress") {
        return None;
    }
    let has_path = obj
        .pointer("/spec/rules")
        .and_then(|r| r.as_array())
        .map(|rules| {
            rules.iter().any(|r| {
                r.pointer("/http/paths")
                    .and_then(|p| p.as_array())
                    .map(|paths| paths.iter().any(|p| p.get("path").and_then(|s| s.as_str()).map(|s| !s.is_empty()).unwrap_or(false)))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    let has_backend = obj.pointer("/spec/defaultBackend").map(|b| !b.is_null()).unwrap_or(false);
    if has_path || has_backend { None } else { Some("ingress defines no routing path".into()) }
}

/// A deployed application addressed as a whole for composite deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub namespace: String,
    pub name: String,
    /// Ingress routing path; the Ingress is skipped when absent.
    pub path: Option<String>,
}

/// Kinds making up an application, in deletion order: traffic and workload first,
/// then what they depend on.
pub const APPLICATION_DELETE_ORDER: [(&str, &str); 7] = [
    ("networking.k8s.io/v1", "Ingress"),
    ("apps/v1", "Deployment"),
    ("v1", "Secret"),
    ("v1", "Service"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("v1", "ServiceAccount"),
];

pub struct Applier {
    cluster: Arc<dyn ClusterApi>,
    retry: RetryPolicy,
}

impl Applier {
    pub fn new(cluster: Arc<dyn ClusterApi>, retry: RetryPolicy) -> Self { Self { cluster, retry } }

    pub fn retry(&self) -> &RetryPolicy { &self.retry }

    /// Create `desired` if absent, otherwise patch it. Returns the cluster's representation.
    pub async fn apply(&self, desired: &Json) -> Result<ApplyOutcome, ClusterError> {
        let t0 = Instant::now();
        let id = ResourceIdentity::from_object(desired)
            .ok_or_else(|| ClusterError::Invalid("object lacks apiVersion/kind/metadata.name".into()))?;
        if let Some(reason) = precondition_unmet(desired) {
            info!(resource = %id, reason = %reason, "skipping apply");
            return Ok(ApplyOutcome::Skipped(reason));
        }
        counter!("apply_attempts", 1u64);
        let cluster = &*self.cluster;
        let id_ref = &id;
        let live = match with_retry(&self.retry, "get", move || cluster.get(id_ref)).await {
            Ok(v) => Some(v),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e);
            }
        };
        let res = match live {
            None => {
                debug!(resource = %id, "creating");
                with_retry(&self.retry, "create", move || cluster.create(desired)).await.map(ApplyOutcome::Created)
            }
            Some(live) => {
                let style = patch_style_for(&id);
                debug!(resource = %id, ?style, live_version = ?live.pointer("/metadata/resourceVersion"), "patching");
                with_retry(&self.retry, "patch", move || cluster.patch(id_ref, desired, style)).await.map(ApplyOutcome::Patched)
            }
        };
        match &res {
            Ok(_) => {
                counter!("apply_ok", 1u64);
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            }
            Err(_) => counter!("apply_err", 1u64),
        }
        res
    }

    /// Read-then-delete. An object that is already gone yields `Ok(None)`.
    pub async fn delete(&self, id: &ResourceIdentity) -> Result<Option<Json>, ClusterError> {
        let cluster = &*self.cluster;
        let live = match with_retry(&self.retry, "get", move || cluster.get(id)).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                debug!(resource = %id, "already absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match with_retry(&self.retry, "delete", move || cluster.delete(id)).await {
            Ok(_) => {
                counter!("delete_ok", 1u64);
                info!(resource = %id, "deleted");
                Ok(Some(live))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete every constituent of `app` in [`APPLICATION_DELETE_ORDER`]. Every kind is
    /// attempted; failures are collected and raised together afterwards.
    pub async fn delete_application(&self, app: &ApplicationRef) -> Result<Vec<ResourceIdentity>, AggregateError> {
        let mut errors = AggregateError::new(format!("failed to delete application {}/{}", app.namespace, app.name));
        let mut deleted = Vec::new();
        for (api_version, kind) in APPLICATION_DELETE_ORDER {
            if kind == "Ingress" && app.path.as_deref().map(str::is_empty).unwrap_or(true) {
                debug!(app = %app.name, "no ingress path; skipping ingress delete");
                continue;
            }
            let id = ResourceIdentity::new(api_version, kind, Some(&app.namespace), &app.name);
            match self.delete(&id).await {
                Ok(Some(_)) => deleted.push(id),
                Ok(None) => {}
                Err(e) => {
                    warn!(resource = %id, error = %e, "delete failed");
                    errors.push(format!("{}: {}", id, e));
                }
            }
        }
        errors.into_result().map(|_| deleted)
    }
}
