//! In-memory [`ClusterApi`] for tests: stores objects, records calls, injects failures.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ksync_core::ResourceIdentity;
use serde_json::Value as Json;

use crate::{ClusterApi, ClusterError, PatchStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ResourceIdentity),
    Create(ResourceIdentity),
    Patch(ResourceIdentity, PatchStyle),
    Delete(ResourceIdentity),
}

struct Failure {
    op: Op,
    id: Option<ResourceIdentity>,
    err: ClusterError,
}

#[derive(Default)]
pub struct MemoryCluster {
    objects: Mutex<BTreeMap<ResourceIdentity, Json>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<Failure>>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Seed an object as if it already existed in the cluster.
    pub fn insert(&self, obj: Json) {
        if let Some(id) = ResourceIdentity::from_object(&obj) {
            self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(id, obj);
        }
    }

    pub fn object(&self, id: &ResourceIdentity) -> Option<Json> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub fn len(&self) -> usize { self.objects.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    /// Fail the next `op` (on `id`, or on anything when `None`) with `err`. Queued failures fire once each, in order.
    pub fn fail(&self, op: Op, id: Option<ResourceIdentity>, err: ClusterError) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).push(Failure { op, id, err });
    }

    fn record(&self, call: Call) { self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call); }

    fn injected(&self, op: Op, id: &ResourceIdentity) -> Result<(), ClusterError> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.iter().position(|f| f.op == op && f.id.as_ref().map(|x| x == id).unwrap_or(true)) {
            Some(i) => Err(failures.remove(i).err),
            None => Ok(()),
        }
    }
}

/// Recursive JSON merge: objects merge key by key, `null` removes, anything else replaces.
fn merge(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (Json::Object(t), Json::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(Json::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, id: &ResourceIdentity) -> Result<Json, ClusterError> {
        self.record(Call::Get(id.clone()));
        self.injected(Op::Get, id)?;
        self.object(id).ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let id = ResourceIdentity::from_object(obj).ok_or_else(|| ClusterError::Invalid("object lacks identity".into()))?;
        self.record(Call::Create(id.clone()));
        self.injected(Op::Create, &id)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(&id) {
            return Err(ClusterError::Rejected { code: 409, message: format!("{} already exists", id) });
        }
        objects.insert(id, obj.clone());
        Ok(obj.clone())
    }

    async fn patch(&self, id: &ResourceIdentity, obj: &Json, style: PatchStyle) -> Result<Json, ClusterError> {
        self.record(Call::Patch(id.clone(), style));
        self.injected(Op::Patch, id)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let live = objects.get_mut(id).ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        merge(live, obj);
        Ok(live.clone())
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<Option<Json>, ClusterError> {
        self.record(Call::Delete(id.clone()));
        self.injected(Op::Delete, id)?;
        match self.objects.lock().unwrap_or_else(PoisonError::into_inner).remove(id) {
            Some(_) => Ok(None),
            None => Err(ClusterError::NotFound(id.to_string())),
        }
    }
}
