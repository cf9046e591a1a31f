use std::path::{Path, PathBuf};

use assert_cmd::Command;
use pretty_assertions::assert_eq;
use serde_json::Value;

fn support_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../support")
}

fn assetinsight() -> Command {
    let mut cmd = Command::cargo_bin("assetinsight").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_transform_load_analyse() {
    let target = tempfile::tempdir().unwrap();
    let schema = support_dir().join("schema/asset-schema.yml");

    let transform = assetinsight()
        .arg("transform")
        .arg("-s")
        .arg(support_dir().join("test-fixtures/assets"))
        .arg("-t")
        .arg(target.path())
        .output()
        .unwrap();
    assert!(transform.status.success());
    let report = stdout_json(&transform);
    assert_eq!(report["successful"], 2);
    assert_eq!(report["failed"], 1);

    let load = assetinsight()
        .arg("load")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(&schema)
        .args(["--mode", "isolated", "--workers", "2"])
        .output()
        .unwrap();
    assert!(load.status.success());
    let report = stdout_json(&load);
    assert_eq!(report["mode"], "isolated");
    assert_eq!(report["rows_loaded"], 6);

    let readiness = assetinsight()
        .arg("readiness")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(&schema)
        .output()
        .unwrap();
    assert!(readiness.status.success());
    let readiness = stdout_json(&readiness);
    assert_eq!(readiness["ready"], true);
    assert_eq!(readiness["health_status"], "HEALTHY");

    let output = target.path().join("ownership.json");
    let analyse = assetinsight()
        .arg("analyse")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(&schema)
        .arg("--output")
        .arg(&output)
        .output()
        .unwrap();
    assert!(analyse.status.success());
    let report = stdout_json(&analyse);
    assert_eq!(report["summary"]["total_assets"], 6);
    assert_eq!(report["parent_cloud"]["rows"][0]["group_key"], "Commerce");
    assert_eq!(report["parent_cloud"]["rows"][0]["total_assets"], 3);
    let written: Value = serde_json::from_str(&std::fs::read_to_string(output).unwrap()).unwrap();
    assert_eq!(written, report);
}

#[test]
fn test_analyse_table_without_data() {
    let target = tempfile::tempdir().unwrap();
    let output = assetinsight()
        .arg("analyse")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(support_dir().join("schema/asset-schema.yml"))
        .args(["--format", "table"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Summary: no data available"));
    assert!(stdout.contains("Parent cloud: no data available"));
}

#[test]
fn test_readiness_of_empty_directory() {
    let target = tempfile::tempdir().unwrap();
    let output = assetinsight()
        .arg("readiness")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(support_dir().join("schema/asset-schema.yml"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let readiness = stdout_json(&output);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["health_status"], "NO_FILES");
}

#[test]
fn test_invalid_schema_fails() {
    let target = tempfile::tempdir().unwrap();
    let schema = target.path().join("schema.yml");
    std::fs::write(&schema, "assets:\n  common:\n    id: UUID\n").unwrap();
    assetinsight()
        .arg("load")
        .arg("-t")
        .arg(target.path())
        .arg("--schema")
        .arg(&schema)
        .assert()
        .failure();
}
