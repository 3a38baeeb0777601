//! Deterministic spec file naming.
//!
//! A lexically sorted listing of the spec directory doubles as a sane apply
//! order: namespaces first, RBAC identities before their bindings, workloads
//! after their config, autoscalers and ingress last.

#![forbid(unsafe_code)]

use crate::ResourceIdentity;

/// Prefix for kinds without an explicit entry.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Two-digit ordering class for a kind.
pub fn priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 10,
        "CustomResourceDefinition" | "StorageClass" | "PersistentVolume" | "PodSecurityPolicy" | "PriorityClass" => 15,
        "ServiceAccount" => 20,
        "ClusterRole" | "Role" => 25,
        "ClusterRoleBinding" | "RoleBinding" => 30,
        "NetworkPolicy" | "ResourceQuota" | "LimitRange" => 35,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" => 40,
        "Service" | "Endpoints" => 55,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => 60,
        "PodDisruptionBudget" => 70,
        "HorizontalPodAutoscaler" | "Ingress" | "IngressClass" => 80,
        _ => DEFAULT_PRIORITY,
    }
}

/// `ServiceAccount` -> `service-account`: lowercase, hyphen at each lower-to-upper boundary.
pub fn kebab_kind(kind: &str) -> String {
    let mut out = String::with_capacity(kind.len() + 4);
    let mut prev_lower = false;
    for c in kind.chars() {
        if c.is_uppercase() && prev_lower {
            out.push('-');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        out.extend(c.to_lowercase());
    }
    out
}

/// Base file name (no extension) for a resource.
///
/// Namespaced: `{prio}_{namespace}_{name}_{kind}`; cluster-scoped: `{prio}_{name}_{kind}`.
pub fn base_name(id: &ResourceIdentity) -> String {
    let prio = priority(&id.kind);
    let kind = kebab_kind(&id.kind);
    match &id.namespace {
        Some(ns) => format!("{:02}_{}_{}_{}", prio, ns, id.name, kind),
        None => format!("{:02}_{}_{}", prio, id.name, kind),
    }
}
