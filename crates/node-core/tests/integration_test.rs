//! End-to-end scenarios for the AVS node package lifecycle manager.
//!
//! Most of these require a running container engine and are marked
//! `#[ignore]`; run them with `cargo test --test integration_test -- --ignored`.
//! The manifest-validation scenario needs no container engine and runs by
//! default.

use std::collections::BTreeMap;
use std::path::Path;

use eigenlayer_node::container::ContainerDriver;
use eigenlayer_node::datadir::DataDir;
use eigenlayer_node::engine::{InstallRequest, InstallSource, OrchestrationEngine, VersionSelector};
use eigenlayer_node::model::BackupId;
use eigenlayer_node::NodeError;
use tempdir::TempDir;

const MOCK_AVS_MANIFEST: &str = r#"
version: v5.5.1
node_version: v1.0.0
name: mock-avs
upgrade: true
profiles:
  - default
"#;

fn mock_avs_profile(container_name: &str) -> String {
    format!(
        r#"
name: default
options:
  - name: main-container-name
    env_key: CONTAINER_NAME
    type: id
    default: {container_name}
api_target:
  service: option-returner
  port: 8080
  path: /eigen/node/health
monitoring:
  targets:
    - service: option-returner
      port: 8080
      path: /eigen/node/metrics
"#
    )
}

const MOCK_AVS_COMPOSE_TEMPLATE: &str = r#"
services:
  option-returner:
    image: mock-avs/option-returner:v5.5.1
    container_name: ${CONTAINER_NAME}
    ports:
      - "8080:8080"
"#;

/// Writes a minimal, well-formed `mock-avs` package under `root/pkg`.
fn write_mock_avs_package(root: &Path, container_name: &str) {
    let pkg_root = root.join("pkg");
    let profile_dir = pkg_root.join("default");
    std::fs::create_dir_all(&profile_dir).unwrap();
    std::fs::write(pkg_root.join("manifest.yml"), MOCK_AVS_MANIFEST).unwrap();
    std::fs::write(profile_dir.join("profile.yml"), mock_avs_profile(container_name)).unwrap();
    std::fs::write(profile_dir.join("docker-compose.yml"), MOCK_AVS_COMPOSE_TEMPLATE).unwrap();
    std::fs::write(profile_dir.join(".env"), "CONTAINER_NAME=\n").unwrap();
}

fn test_engine(data_root: &Path) -> OrchestrationEngine {
    let data_dir = DataDir::new(data_root.to_path_buf());
    let driver = ContainerDriver::connect().expect("connecting to the container engine never touches it eagerly");
    OrchestrationEngine::new(data_dir, driver)
}

/// Scenario 6: a syntactically invalid manifest fails `local-install`
/// before any instance or temp directory is left behind. Manifest parsing
/// happens before any container-engine call, so this needs no Docker.
#[tokio::test]
async fn local_install_with_invalid_manifest_leaves_no_residue() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();

    let pkg_root = pkg_dir.path().join("pkg");
    std::fs::create_dir_all(&pkg_root).unwrap();
    // Missing node_version/name, no profiles: fails manifest validation.
    std::fs::write(pkg_root.join("manifest.yml"), "version: v1.0.0\nnode_version: \"\"\nname: \"\"\nupgrade: true\nprofiles: []\n").unwrap();

    let engine = test_engine(data_root.path());
    let req = InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: "default".to_string(),
        option_values: BTreeMap::new(),
        run_after: false,
        version: VersionSelector::Latest,
        auth: None,
    };

    let err = engine.install(req).await.expect_err("invalid manifest must fail install");
    assert!(matches!(err, NodeError::InvalidConf { .. }));

    assert!(engine.list_instances().await.unwrap().is_empty());
    let temp_dir = data_root.path().join("temp");
    if temp_dir.is_dir() {
        assert!(std::fs::read_dir(&temp_dir).unwrap().next().is_none(), "temp/ must be empty after a failed install");
    }
}

/// Scenario 1: installing a mock AVS with `--run` brings up its container
/// and the API health check succeeds.
#[tokio::test]
#[ignore = "requires a running container engine"]
async fn install_mock_avs_and_health_check_passes() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();
    write_mock_avs_package(pkg_dir.path(), "mock-avs-option-returner");

    let engine = test_engine(data_root.path());
    engine.monitoring().install().await.unwrap();

    let req = InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: "default".to_string(),
        option_values: BTreeMap::new(),
        run_after: true,
        version: VersionSelector::Latest,
        auth: None,
    };
    let instance_id = engine.install(req).await.unwrap();
    assert_eq!(instance_id, "mock-avs-default");

    let health_url = "http://localhost:8080/eigen/node/health";
    let response = reqwest::get(health_url).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    engine.uninstall(&instance_id).await.unwrap();
}

/// Scenario 2: installing the same profile/tag/url twice fails with
/// `DuplicateInstance`, and the first installation keeps running.
#[tokio::test]
#[ignore = "requires a running container engine"]
async fn duplicate_install_is_rejected_and_first_instance_survives() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();
    write_mock_avs_package(pkg_dir.path(), "mock-avs-dup-returner");

    let engine = test_engine(data_root.path());
    let make_req = || InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: "integration".to_string(),
        option_values: BTreeMap::new(),
        run_after: true,
        version: VersionSelector::Latest,
        auth: None,
    };

    let instance_id = engine.install(make_req()).await.unwrap();

    let err = engine.install(make_req()).await.expect_err("second install must fail");
    assert!(matches!(err, NodeError::DuplicateInstance { .. }));

    let state = engine.state(&instance_id).await.unwrap();
    assert_eq!(state, eigenlayer_node::model::InstanceState::InstalledRunning);

    engine.uninstall(&instance_id).await.unwrap();
}

/// Scenario 3: two installs with different tags but a colliding container
/// name fail at compose-create for the second; no second instance
/// directory is left behind and the monitoring stack is untouched.
#[tokio::test]
#[ignore = "requires a running container engine"]
async fn compose_create_failure_leaves_no_instance_and_monitoring_survives() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();
    // Both profiles render the same fixed container name, which will
    // collide at `docker compose create` for the second instance.
    write_mock_avs_package(pkg_dir.path(), "mock-avs-fixed-name");

    let engine = test_engine(data_root.path());
    engine.monitoring().install().await.unwrap();

    let req = |tag: &str| InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: tag.to_string(),
        option_values: BTreeMap::new(),
        run_after: false,
        version: VersionSelector::Latest,
        auth: None,
    };

    let first = engine.install(req("first")).await.unwrap();
    let err = engine.install(req("second")).await.expect_err("colliding container name must fail compose-create");
    assert!(matches!(err, NodeError::External(_)));

    assert!(!engine.list_instances().await.unwrap().contains(&"mock-avs-second".to_string()));
    assert_eq!(engine.monitoring().status().await.unwrap(), eigenlayer_node::model::MonitoringState::InstalledRunning);

    engine.uninstall(&first).await.unwrap();
}

/// Scenario 4: after `init-monitoring` and an install declaring a scrape
/// target, Prometheus lists the instance's container IP:port with the
/// `instanceID` label and an `up` health.
#[tokio::test]
#[ignore = "requires a running container engine"]
async fn monitoring_target_is_registered_and_scraped() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();
    write_mock_avs_package(pkg_dir.path(), "mock-avs-metrics-target");

    let engine = test_engine(data_root.path());
    engine.monitoring().install().await.unwrap();

    let req = InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: "default".to_string(),
        option_values: BTreeMap::new(),
        run_after: true,
        version: VersionSelector::Latest,
        auth: None,
    };
    let instance_id = engine.install(req).await.unwrap();

    let targets_url = "http://localhost:9090/api/v1/targets";
    let body: serde_json::Value = reqwest::get(targets_url).await.unwrap().json().await.unwrap();
    let active = body["data"]["activeTargets"].as_array().unwrap();
    let matched = active.iter().any(|t| {
        t["labels"]["instanceID"].as_str() == Some(instance_id.as_str()) && t["health"].as_str() == Some("up")
    });
    assert!(matched, "expected a scraped target labeled instanceID={instance_id}");

    engine.uninstall(&instance_id).await.unwrap();
}

/// Scenario 5: `backup` then `uninstall` then `restore` reproduces
/// `state.json` byte-for-byte, and `--run` on restore brings the health
/// check back up.
#[tokio::test]
#[ignore = "requires a running container engine"]
async fn backup_uninstall_restore_round_trips_state() {
    let data_root = TempDir::new("eigen-data").unwrap();
    let pkg_dir = TempDir::new("mock-avs-pkg").unwrap();
    write_mock_avs_package(pkg_dir.path(), "mock-avs-backup-target");

    let engine = test_engine(data_root.path());
    let req = InstallRequest {
        source: InstallSource::Local(pkg_dir.path().to_path_buf()),
        profile: "default".to_string(),
        tag: "default".to_string(),
        option_values: BTreeMap::new(),
        run_after: true,
        version: VersionSelector::Latest,
        auth: None,
    };
    let instance_id = engine.install(req).await.unwrap();

    let data_dir = DataDir::new(data_root.path().to_path_buf());
    let before = data_dir.instance(&instance_id).await.unwrap();

    let backup_id = engine.backup(&instance_id).await.unwrap();
    engine.uninstall(&instance_id).await.unwrap();
    engine.restore(&backup_id, true).await.unwrap();

    let after = data_dir.instance(&instance_id).await.unwrap();
    assert_eq!(before, after);

    let response = reqwest::get("http://localhost:8080/eigen/node/health").await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    engine.uninstall(&instance_id).await.unwrap();
}

#[test]
fn backup_id_parses_from_cli_style_argument() {
    let id = BackupId::new("mock-avs-default", 1_700_000_000);
    let parsed = BackupId::parse(&id.format()).unwrap();
    assert_eq!(parsed, id);
}
