//! ksync spec store: the flat directory of JSON/YAML spec files in a working copy.
//!
//! Indexing is eager: spec directories are small and flat. A file that fails
//! to parse is logged and left out of the index; it never blocks the rest.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ksync_core::ResourceIdentity;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Extension used when allocating a new spec file.
pub const NEW_SPEC_EXTENSION: &str = "json";

fn max_spec_bytes() -> usize {
    std::env::var("KSYNC_MAX_SPEC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_spec_nodes() -> usize {
    std::env::var("KSYNC_MAX_SPEC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecFormat {
    Json,
    Yaml,
}

impl SpecFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(SpecFormat::Json),
            Some("yaml") | Some("yml") => Some(SpecFormat::Yaml),
            _ => None,
        }
    }
}

/// A parsed spec file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecFileEntry {
    pub path: PathBuf,
    pub format: SpecFormat,
    pub object: Json,
}

impl SpecFileEntry {
    pub fn identity(&self) -> Option<ResourceIdentity> { ResourceIdentity::from_object(&self.object) }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    }
}

/// Whether a repository-relative path is covered by the spec glob: root level, `.json|.yaml|.yml`.
pub fn is_spec_path(rel: &str) -> bool {
    !rel.contains('/') && SpecFormat::from_path(Path::new(rel)).is_some()
}

/// Parse spec text in the given format into a JSON object.
pub fn parse_spec(text: &str, format: SpecFormat) -> Result<Json> {
    if text.len() > max_spec_bytes() {
        return Err(anyhow!("spec too large (>{} bytes)", max_spec_bytes()));
    }
    let json = match format {
        SpecFormat::Json => serde_json::from_str::<Json>(text).context("parsing JSON")?,
        SpecFormat::Yaml => {
            let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
            serde_json::to_value(val).context("converting YAML to JSON")?
        }
    };
    if !json.is_object() {
        return Err(anyhow!("spec is not an object"));
    }
    if json_node_budget_exceeded(&json, max_spec_nodes()) {
        return Err(anyhow!("spec too complex (>{} nodes)", max_spec_nodes()));
    }
    Ok(json)
}

/// Read and parse one spec file.
pub fn load_spec(path: &Path) -> Result<SpecFileEntry> {
    let format = SpecFormat::from_path(path).ok_or_else(|| anyhow!("{} is not a spec file", path.display()))?;
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let object = parse_spec(&text, format).with_context(|| format!("{}", path.display()))?;
    Ok(SpecFileEntry { path: path.to_path_buf(), format, object })
}

/// Index every spec file directly under `root`, sorted by file name.
pub fn index(root: &Path) -> Result<Vec<SpecFileEntry>> {
    let mut paths = Vec::new();
    for ent in std::fs::read_dir(root).with_context(|| format!("listing {}", root.display()))? {
        let ent = ent?;
        if !ent.file_type()?.is_file() { continue; }
        let path = ent.path();
        if SpecFormat::from_path(&path).is_some() { paths.push(path); }
    }
    paths.sort();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        match load_spec(&path) {
            Ok(e) => out.push(e),
            Err(e) => {
                counter!("spec_parse_err", 1u64);
                warn!(path = %path.display(), error = %format!("{:#}", e), "skipping unparseable spec file");
            }
        }
    }
    debug!(root = %root.display(), files = out.len(), "indexed spec store");
    Ok(out)
}

/// First entry whose identity equals `id`.
pub fn match_by_identity<'a>(id: &ResourceIdentity, entries: &'a [SpecFileEntry]) -> Option<&'a SpecFileEntry> {
    entries.iter().find(|e| e.identity().as_ref() == Some(id))
}

/// Recursively rebuild `v` with object keys in lexical order.
pub fn sort_keys(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[k]));
            }
            Json::Object(out)
        }
        Json::Array(arr) => Json::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Deterministic text for a spec: YAML as YAML, otherwise two-space JSON; keys sorted, trailing newline.
pub fn serialize(obj: &Json, format: SpecFormat) -> Result<String> {
    let sorted = sort_keys(obj);
    match format {
        SpecFormat::Json => {
            let mut s = serde_json::to_string_pretty(&sorted).context("serializing JSON spec")?;
            s.push('\n');
            Ok(s)
        }
        SpecFormat::Yaml => serde_yaml::to_string(&sorted).context("serializing YAML spec"),
    }
}

/// Drop server-populated fields so a re-observed object serializes the same as what was applied.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
                obj.remove(k);
            }
            if let Some(annos) = obj.get_mut("annotations").and_then(|a| a.as_object_mut()) {
                annos.remove("kubectl.kubernetes.io/last-applied-configuration");
                annos.remove("deployment.kubernetes.io/revision");
            }
            if obj.get("annotations").and_then(|a| a.as_object()).map(|a| a.is_empty()).unwrap_or(false) {
                obj.remove("annotations");
            }
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, obj: Json) -> SpecFileEntry {
        SpecFileEntry { path: PathBuf::from(name), format: SpecFormat::Json, object: obj }
    }

    fn obj(api: &str, kind: &str, ns: Option<&str>, name: &str) -> Json {
        let mut meta = json!({ "name": name });
        if let Some(ns) = ns { meta["namespace"] = json!(ns); }
        json!({ "apiVersion": api, "kind": kind, "metadata": meta })
    }

    #[test]
    fn spec_glob_is_flat_and_extension_bound() {
        assert!(is_spec_path("60_prod_web_deployment.json"));
        assert!(is_spec_path("a.yaml"));
        assert!(is_spec_path("a b.yml"));
        assert!(!is_spec_path("sub/a.json"));
        assert!(!is_spec_path("README.md"));
        assert!(!is_spec_path("noext"));
    }

    #[test]
    fn match_picks_exact_identity_among_near_misses() {
        let entries = vec![
            entry("a.json", obj("apps/v1", "Deployment", Some("dev"), "web")),
            entry("b.json", obj("apps/v1", "StatefulSet", Some("prod"), "web")),
            entry("c.json", obj("apps/v1beta1", "Deployment", Some("prod"), "web")),
            entry("d.json", obj("apps/v1", "Deployment", Some("prod"), "api")),
            entry("e.json", obj("apps/v1", "Deployment", Some("prod"), "web")),
        ];
        let id = ResourceIdentity::new("apps/v1", "Deployment", Some("prod"), "web");
        assert_eq!(match_by_identity(&id, &entries).unwrap().path, PathBuf::from("e.json"));
        let none = ResourceIdentity::new("apps/v1", "Deployment", Some("qa"), "web");
        assert!(match_by_identity(&none, &entries).is_none());
    }

    #[test]
    fn match_does_not_treat_missing_namespace_as_empty() {
        let entries = vec![entry("a.json", obj("v1", "Namespace", None, "prod"))];
        let with_empty = ResourceIdentity::new("v1", "Namespace", Some(""), "prod");
        assert!(match_by_identity(&with_empty, &entries).is_none());
        let absent = ResourceIdentity::new("v1", "Namespace", None, "prod");
        assert!(match_by_identity(&absent, &entries).is_some());
    }

    #[test]
    fn serialize_sorts_keys_and_keeps_format() {
        let v = json!({"metadata": {"name": "x"}, "kind": "Service", "apiVersion": "v1"});
        let s = serialize(&v, SpecFormat::Json).unwrap();
        assert!(s.starts_with("{\n  \"apiVersion\": \"v1\",\n  \"kind\": \"Service\""), "{}", s);
        assert!(s.ends_with("}\n"));
        let y = serialize(&v, SpecFormat::Yaml).unwrap();
        assert!(y.starts_with("apiVersion: v1\nkind: Service\n"), "{}", y);
        assert_eq!(serialize(&v, SpecFormat::Json).unwrap(), s);
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "0000",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { "kubectl.kubernetes.io/last-applied-configuration": "{}" },
                "labels": { "app": "x" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "annotations"] {
            assert!(!meta.contains_key(k), "{} survived", k);
        }
        assert!(meta.contains_key("labels"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(parse_spec("[1, 2]", SpecFormat::Json).is_err());
        assert!(parse_spec("- a\n- b\n", SpecFormat::Yaml).is_err());
        assert!(parse_spec("kind: Service\n", SpecFormat::Yaml).is_ok());
    }
}
