//! Manifest loading against the public API: the YAML shape documented in the
//! README must deserialize, validate, and fail fast on malformed stages.

use stagecraft::aws::{build_order, Config, Error};
use std::path::PathBuf;

const MANIFEST: &str = r#"
project: web
region: us-west-2
repository: web
stages:
  - name: beta
    domain: beta.example.com
    zone_id: Z0123456789ABCDEFGHIJ
    min_instances: 1
    max_instances: 1
    desired_instances: 1
  - name: prod
    domain: example.com
    zone_id: ZJIHGFEDCBA9876543210
    min_instances: 1
    max_instances: 2
    desired_instances: 1
"#;

fn write_manifest(test_name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stagecraft_test_{test_name}"));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("manifest.yaml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_manifest() {
    let path = write_manifest("load", MANIFEST);
    let config = Config::load(&path).unwrap();
    assert_eq!(config.project, "web");
    assert_eq!(config.region, "us-west-2");
    assert_eq!(config.repository, "web");
    assert_eq!(config.stages.len(), 2);

    let beta = &config.stages[0];
    assert_eq!(beta.name, "beta");
    assert_eq!(beta.domain, "beta.example.com");
    assert_eq!((beta.min_instances, beta.desired_instances, beta.max_instances), (1, 1, 1));

    let prod = &config.stages[1];
    assert_eq!(prod.name, "prod");
    assert_eq!((prod.min_instances, prod.desired_instances, prod.max_instances), (1, 1, 2));
}

#[test]
fn test_load_rejects_zero_capacity() {
    let manifest = MANIFEST
        .replace("min_instances: 1", "min_instances: 0")
        .replace("desired_instances: 1", "desired_instances: 0")
        .replace("max_instances: 1", "max_instances: 0");
    let path = write_manifest("zero_capacity", &manifest);
    assert!(matches!(
        Config::load(&path),
        Err(Error::InvalidCapacity { .. })
    ));
}

#[test]
fn test_load_rejects_duplicate_stages() {
    let manifest = MANIFEST.replace("name: prod", "name: beta");
    let path = write_manifest("duplicate", &manifest);
    assert!(matches!(Config::load(&path), Err(Error::DuplicateStage(_))));
}

#[test]
fn test_load_rejects_missing_file() {
    let path = std::env::temp_dir().join("stagecraft_test_missing/manifest.yaml");
    assert!(matches!(Config::load(&path), Err(Error::Io(_))));
}

#[test]
fn test_build_plan_is_shared_by_every_stage() {
    // The plan is a property of the topology, not of any manifest
    let order = build_order();
    assert!(!order.is_empty());
    for (idx, resource) in order.iter().enumerate() {
        assert!(!order[..idx].contains(resource));
    }
}
