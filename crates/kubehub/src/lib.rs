//! ksync kubehub: the cluster API seam, its kube-rs implementation, list and watch wiring.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use ksync_core::{Delta, DeltaKind, ResourceIdentity, SyncError, TOOL_NAME};
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod mock;

/// Failure classes the applier distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Network, timeout, throttling or server-side 5xx; worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Validation, conflict, forbidden and friends; retrying will not help.
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("kind not served by the cluster: {0}")]
    UnknownKind(String),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }
    pub fn is_transient(&self) -> bool { matches!(self, ClusterError::Transient(_)) }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::NotFound(ae.message),
                408 | 429 | 500 | 502 | 503 | 504 => ClusterError::Transient(format!("{} ({})", ae.message, ae.code)),
                code => ClusterError::Rejected { code, message: ae.message },
            },
            kube::Error::HyperError(e) => ClusterError::Transient(e.to_string()),
            kube::Error::Service(e) => ClusterError::Transient(e.to_string()),
            other => ClusterError::Rejected { code: 0, message: other.to_string() },
        }
    }
}

impl From<ClusterError> for SyncError {
    fn from(e: ClusterError) -> Self { SyncError::Cluster(e.to_string()) }
}

/// Patch flavour, chosen per call. Strategic merge is only understood for built-in kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStyle {
    Strategic,
    Merge,
}

pub fn patch_style_for(id: &ResourceIdentity) -> PatchStyle {
    let (group, _) = id.group_version();
    if group.is_empty() || !group.contains('.') || group.ends_with(".k8s.io") {
        PatchStyle::Strategic
    } else {
        PatchStyle::Merge
    }
}

/// Per-resource cluster operations. Objects travel as raw JSON.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, id: &ResourceIdentity) -> Result<Json, ClusterError>;
    async fn create(&self, obj: &Json) -> Result<Json, ClusterError>;
    async fn patch(&self, id: &ResourceIdentity, obj: &Json, style: PatchStyle) -> Result<Json, ClusterError>;
    /// `Ok(Some(obj))` while the object is still terminating, `Ok(None)` once it is gone.
    async fn delete(&self, id: &ResourceIdentity) -> Result<Option<Json>, ClusterError>;
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig/in-cluster env")
}

/// kube-rs backed [`ClusterApi`] with cached discovery (re-run once on a miss, so
/// kinds registered mid-cycle by a CRD apply become resolvable).
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let client = get_kube_client().await?;
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        Ok(Self { client, discovery: RwLock::new(discovery) })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(found) = lookup(&*self.discovery.read().await, gvk) {
            return Ok(found);
        }
        debug!(kind = %gvk.kind, "kind missing from discovery; refreshing");
        let fresh = Discovery::new(self.client.clone()).run().await?;
        let found = lookup(&fresh, gvk);
        *self.discovery.write().await = fresh;
        found.ok_or_else(|| ClusterError::UnknownKind(format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api_for(&self, id: &ResourceIdentity) -> Result<Api<DynamicObject>, ClusterError> {
        let (group, version) = id.group_version();
        let (ar, namespaced) = self.resolve(&GroupVersionKind::gvk(group, version, &id.kind)).await?;
        if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ClusterError::Invalid(format!("{}: namespace required for namespaced kind", id))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

fn lookup(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
    discovery.resolve_gvk(gvk).map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(e.to_string()))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, id: &ResourceIdentity) -> Result<Json, ClusterError> {
        let api = self.api_for(id).await?;
        to_json(&api.get(&id.name).await?)
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let id = ResourceIdentity::from_object(obj).ok_or_else(|| ClusterError::Invalid("object lacks apiVersion/kind/metadata.name".into()))?;
        let api = self.api_for(&id).await?;
        let dobj: DynamicObject = serde_json::from_value(obj.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let pp = PostParams { field_manager: Some(TOOL_NAME.to_string()), ..Default::default() };
        counter!("kube_create_total", 1u64);
        to_json(&api.create(&pp, &dobj).await?)
    }

    async fn patch(&self, id: &ResourceIdentity, obj: &Json, style: PatchStyle) -> Result<Json, ClusterError> {
        let api = self.api_for(id).await?;
        let pp = PatchParams { field_manager: Some(TOOL_NAME.to_string()), ..Default::default() };
        let patch = match style {
            PatchStyle::Strategic => Patch::Strategic(obj),
            PatchStyle::Merge => Patch::Merge(obj),
        };
        counter!("kube_patch_total", 1u64);
        to_json(&api.patch(&id.name, &pp, &patch).await?)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<Option<Json>, ClusterError> {
        let api = self.api_for(id).await?;
        counter!("kube_delete_total", 1u64);
        let res = api.delete(&id.name, &DeleteParams::default()).await?;
        Ok(res.either(|terminating| serde_json::to_value(terminating).ok(), |_status| None))
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn api_for_key(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let discovery = Discovery::new(client.clone()).run().await?;
    let (ar, namespaced) = lookup(&discovery, &gvk).ok_or_else(|| anyhow!("GVK not found: {}", gvk_key))?;
    Ok(match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    })
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// `apiVersion`/`kind` are not always populated on list items; restore them from the resource.
fn with_type_meta(mut v: Json, ar: &ApiResource) -> Json {
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion").or_insert_with(|| Json::String(ar.api_version.clone()));
        obj.entry("kind").or_insert_with(|| Json::String(ar.kind.clone()));
    }
    v
}

fn to_uid(uid_str: &str) -> Result<ksync_core::Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

fn delta_from(obj: &DynamicObject, ar: &ApiResource, kind: DeltaKind) -> Result<Delta> {
    let uid_str = obj.metadata.uid.as_deref().ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    let mut raw = with_type_meta(serde_json::to_value(obj).context("serializing DynamicObject")?, ar);
    strip_managed_fields(&mut raw);
    Ok(Delta { uid, kind, raw })
}

/// One-shot list of every object of a GVK, optionally within one namespace.
pub async fn list_objects(gvk_key: &str, namespace: Option<&str>) -> Result<Vec<Json>> {
    let client = get_kube_client().await?;
    let api = api_for_key(client, gvk_key, namespace).await?;
    let ar = api_resource_for(gvk_key)?;
    let list = api.list(&ListParams::default()).await?;
    let mut out = Vec::with_capacity(list.items.len());
    for o in list.items.iter() {
        let mut v = with_type_meta(serde_json::to_value(o)?, &ar);
        strip_managed_fields(&mut v);
        out.push(v);
    }
    info!(gvk = %gvk_key, ns = ?namespace, count = out.len(), "listed objects");
    Ok(out)
}

fn api_resource_for(gvk_key: &str) -> Result<ApiResource> {
    let gvk = parse_gvk_key(gvk_key)?;
    Ok(ApiResource::from_gvk(&gvk))
}

/// Start list+watch for a GVK and forward deltas into `delta_tx` until the stream ends.
pub async fn start_watcher(gvk_key: &str, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let client = get_kube_client().await?;
    let api = api_for_key(client, gvk_key, namespace).await?;
    let ar = api_resource_for(gvk_key)?;
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let batch = match ev {
            Event::Applied(o) => vec![(o, DeltaKind::Applied)],
            Event::Deleted(o) => vec![(o, DeltaKind::Deleted)],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.into_iter().map(|o| (o, DeltaKind::Applied)).collect()
            }
        };
        for (o, kind) in batch {
            match delta_from(&o, &ar, kind) {
                Ok(d) => {
                    if delta_tx.send(d).await.is_err() {
                        info!(gvk = %gvk_key, "delta receiver closed; stopping watcher");
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed watch event"),
            }
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
    Ok(())
}
