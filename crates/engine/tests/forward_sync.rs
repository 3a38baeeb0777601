#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use common::{engine, target, MemoryRepo};
use ksync_core::{ResourceIdentity, SyncAction, SyncError};
use ksync_git::guard::{cursor_message, parse_cursor};
use ksync_git::{CommitInfo, PushEvent};
use ksync_kubehub::mock::{Call, MemoryCluster, Op};
use ksync_kubehub::ClusterError;
use serde_json::json;

const NAMESPACE: &str = r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "prod"}}"#;
const DEPLOYMENT: &str = r#"{"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "prod"}, "spec": {"replicas": 2}}"#;
const CONFIGMAP_YAML: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: prod\ndata:\n  mode: fast\n";

fn dep_id() -> ResourceIdentity { ResourceIdentity::new("apps/v1", "Deployment", Some("prod"), "web") }
fn cm_id() -> ResourceIdentity { ResourceIdentity::new("v1", "ConfigMap", Some("prod"), "settings") }

fn creates(cluster: &MemoryCluster) -> Vec<String> {
    cluster.calls().into_iter().filter_map(|c| match c { Call::Create(id) => Some(id.kind), _ => None }).collect()
}

/// A repository whose history already carries a cursor.
fn synced_repo() -> MemoryRepo {
    let repo = MemoryRepo::new();
    repo.write("60_prod_web_deployment.json", DEPLOYMENT);
    let sha = repo.commit("add web");
    repo.commit(&cursor_message(&sha));
    repo
}

#[tokio::test]
async fn without_cursor_the_store_is_bootstrapped_in_naming_order() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = MemoryRepo::new();
    repo.write("60_prod_web_deployment.json", DEPLOYMENT);
    repo.write("ns.json", NAMESPACE);
    repo.write("README.md", "specs");
    let head = repo.commit("initial");

    let report = eng.forward(&repo).await.unwrap();
    assert!(report.bootstrap);
    assert_eq!(report.applied, 2);
    assert_eq!(creates(&cluster), vec!["Namespace", "Deployment"]);
    assert_eq!(report.cursor.as_deref(), Some(head.as_str()));
    let last = repo.head().unwrap();
    assert_eq!(parse_cursor(&last.message), Some(head.as_str()));
    assert_eq!(repo.pushes(), 1);
}

#[tokio::test]
async fn commits_after_the_cursor_are_applied_in_order() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(serde_json::from_str(DEPLOYMENT).unwrap());
    let eng = engine(&cluster, None);
    let repo = synced_repo();

    repo.write("40_prod_settings_config-map.yaml", CONFIGMAP_YAML);
    let c1 = repo.commit("add settings");
    repo.remove("60_prod_web_deployment.json");
    repo.write("notes.txt", "ignored");
    let c2 = repo.commit("retire web");

    let report = eng.forward(&repo).await.unwrap();
    assert!(!report.bootstrap);
    assert_eq!(report.commits, vec![c1, c2.clone()]);
    assert_eq!((report.applied, report.deleted), (1, 1));
    assert_eq!(cluster.object(&cm_id()).unwrap()["data"]["mode"], "fast");
    assert!(cluster.object(&dep_id()).is_none());
    assert_eq!(report.cursor.as_deref(), Some(c2.as_str()));

    // The cursor now covers everything.
    let calls = cluster.calls().len();
    let again = eng.forward(&repo).await.unwrap();
    assert!(again.commits.is_empty());
    assert_eq!(cluster.calls().len(), calls);
}

#[tokio::test]
async fn generated_commits_are_not_reapplied() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = synced_repo();

    // Reverse sync writes a file; the forward pass must not push it back.
    let live = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "settings", "namespace": "prod"}, "data": {"mode": "slow"}});
    eng.reverse(&repo, &[live], SyncAction::Upsert).await.unwrap();

    let report = eng.forward(&repo).await.unwrap();
    assert!(report.commits.is_empty());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn failures_are_collected_and_the_cursor_is_held() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = synced_repo();

    repo.write("40_prod_settings_config-map.yaml", CONFIGMAP_YAML);
    repo.write("60_prod_web_deployment.json", DEPLOYMENT.replace("\"replicas\": 2", "\"replicas\": 4").as_str());
    repo.commit("several changes");
    cluster.fail(Op::Create, Some(cm_id()), ClusterError::Rejected { code: 422, message: "data.mode: invalid".into() });
    let pushes = repo.pushes();
    let commits = repo.messages().len();

    let err = eng.forward(&repo).await.unwrap_err();
    let agg = match err {
        SyncError::Aggregate(agg) => agg,
        other => panic!("expected aggregate, got {:?}", other),
    };
    assert_eq!(agg.len(), 1);
    assert!(agg.failures[0].contains("40_prod_settings_config-map.yaml") && agg.failures[0].contains("422"));
    // The sibling still went through.
    assert_eq!(cluster.object(&dep_id()).unwrap()["spec"]["replicas"], 4);
    assert_eq!(repo.pushes(), pushes);
    assert_eq!(repo.messages().len(), commits);
}

#[tokio::test]
async fn unparseable_files_are_skipped_and_the_cursor_advances() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = synced_repo();

    repo.write("zz_typo.json", "{ not json");
    repo.commit("add typo");
    repo.write("40_prod_settings_config-map.yaml", CONFIGMAP_YAML);
    let last = repo.commit("add settings");

    let report = eng.forward(&repo).await.unwrap();
    assert_eq!((report.applied, report.skipped), (1, 1));
    assert_eq!(report.cursor.as_deref(), Some(last.as_str()));
    assert!(cluster.object(&cm_id()).is_some());

    // Nothing left pending once the cursor moved past the bad file.
    let again = eng.forward(&repo).await.unwrap();
    assert!(again.commits.is_empty());
}

#[tokio::test]
async fn renamed_spec_file_keeps_its_resource() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(serde_json::from_str(DEPLOYMENT).unwrap());
    let eng = engine(&cluster, None);
    let repo = synced_repo();

    // New path sorts before the old one, so the apply runs first.
    repo.remove("60_prod_web_deployment.json");
    repo.write("10_web.json", DEPLOYMENT);
    repo.commit("rename web spec");

    let report = eng.forward(&repo).await.unwrap();
    assert_eq!((report.applied, report.deleted, report.skipped), (1, 0, 1));
    assert!(cluster.object(&dep_id()).is_some());
    assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Delete(_))));
}

#[tokio::test]
async fn secrets_are_decrypted_before_apply() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, Some("passphrase"));
    let repo = synced_repo();
    let sealed = ksync_cipher::encrypt("czNjcjN0", "passphrase").unwrap();
    let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db", "namespace": "prod"}, "data": {"password": sealed}});
    repo.write("40_prod_db_secret.json", &secret.to_string());
    repo.commit("add db secret");

    eng.forward(&repo).await.unwrap();
    let live = cluster.object(&ResourceIdentity::new("v1", "Secret", Some("prod"), "db")).unwrap();
    assert_eq!(live["data"]["password"], "czNjcjN0");
}

#[tokio::test]
async fn pushes_for_other_targets_are_ignored() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = synced_repo();
    let t = target();
    let push = PushEvent { provider: t.provider.clone(), owner: t.owner.clone(), repo: t.repo.clone(), branch: "feature".into(), commits: vec![] };
    assert_eq!(eng.on_push(&repo, &push).await.unwrap(), None);
}

#[tokio::test]
async fn push_events_apply_only_source_commits() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, None);
    let repo = synced_repo();
    repo.write("40_prod_settings_config-map.yaml", CONFIGMAP_YAML);
    let sha = repo.commit("add settings");
    let generated = repo.commit(&cursor_message(&sha));

    let t = target();
    let push = PushEvent {
        provider: t.provider.clone(),
        owner: t.owner.clone(),
        repo: t.repo.clone(),
        branch: t.branch.clone(),
        commits: vec![
            CommitInfo { sha: sha.clone(), parent: None, message: "add settings".into() },
            CommitInfo { sha: generated, parent: None, message: cursor_message(&sha) },
        ],
    };
    let report = eng.on_push(&repo, &push).await.unwrap().unwrap();
    assert_eq!(report.commits, vec![sha]);
    assert_eq!(report.applied, 1);
    assert!(report.cursor.is_none());
    assert_eq!(creates(&cluster), vec!["ConfigMap"]);
}
