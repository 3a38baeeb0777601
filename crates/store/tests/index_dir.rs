#![forbid(unsafe_code)]

use std::fs;

use ksync_core::ResourceIdentity;
use ksync_store::{index, match_by_identity, SpecFormat};

#[test]
fn index_skips_malformed_nested_and_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("55_prod_web_service.json"), r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"web","namespace":"prod"}}"#).unwrap();
    fs::write(root.join("20_prod_web_service-account.yaml"), "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: web\n  namespace: prod\n").unwrap();
    fs::write(root.join("10_prod_namespace.yml"), "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: prod\n").unwrap();
    fs::write(root.join("broken.json"), "{ not json").unwrap();
    fs::write(root.join("README.md"), "# specs").unwrap();
    fs::create_dir(root.join("nested")).unwrap();
    fs::write(root.join("nested").join("x.json"), r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x"}}"#).unwrap();

    let entries = index(root).unwrap();
    let names: Vec<String> = entries.iter().map(|e| e.file_name()).collect();
    assert_eq!(names, vec!["10_prod_namespace.yml", "20_prod_web_service-account.yaml", "55_prod_web_service.json"]);
    assert_eq!(entries[1].format, SpecFormat::Yaml);

    let sa = ResourceIdentity::new("v1", "ServiceAccount", Some("prod"), "web");
    assert_eq!(match_by_identity(&sa, &entries).unwrap().file_name(), "20_prod_web_service-account.yaml");
    let cm = ResourceIdentity::new("v1", "ConfigMap", None, "x");
    assert!(match_by_identity(&cm, &entries).is_none());
}

#[test]
fn index_of_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(index(&dir.path().join("absent")).is_err());
}
