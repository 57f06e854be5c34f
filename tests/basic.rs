use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use std::fs;
use tempfile::tempdir;

fn snapsync() -> Command {
    Command::cargo_bin("snapsync").unwrap()
}

#[test]
fn test_config_file_loading() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("config.json");
    let doc = json!({
        "sync_jobs": [
            { "name": "file_sync", "config": { "paths": ["/home/alice/"] } },
            { "name": "dummy_success", "enabled": false, "config": { "duration": "2s" } }
        ],
        "btrfs_snapshots": { "subvolumes": ["@", "@home"], "max_age": "14days" },
        "disk_space_monitor": { "runtime_minimum": "10 GiB" }
    });
    fs::write(&path, doc.to_string())?;

    let config = snapsync::config::load_config(&path)?;
    assert!(config.validate().is_empty());
    assert_eq!(config.sync_jobs.len(), 2);
    assert_eq!(
        config.btrfs_snapshots.max_age,
        std::time::Duration::from_secs(14 * 86_400)
    );
    let plan = snapsync::orchestrator::build_plan(&config, "20250102T030405-ab12cd34")?;
    assert_eq!(plan.background.len(), 1);
    assert_eq!(plan.sequential.len(), 3);
    Ok(())
}

#[test]
fn test_unknown_config_field_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{ "btrfs_snapshots": { "subvolumes": ["@"] }, "snapshot_root": "/x" }"#,
    )?;
    let err = snapsync::config::load_config(&path).unwrap_err();
    assert!(format!("{err:#}").contains("unknown field"));
    Ok(())
}

#[test]
fn test_schema_generation() {
    let schema = snapsync::config::generate_schema();
    assert!(schema.contains("$schema"));
    assert!(schema.contains("btrfs_snapshots"));
}

#[test]
fn test_cli_schema() {
    snapsync()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("disk_space_monitor"));
}

#[test]
fn test_cli_job_schema() {
    snapsync()
        .args(["schema", "--job", "file_sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exclude"));
    snapsync()
        .args(["schema", "--job", "dummy_fail"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fail_at_percent"));
    snapsync()
        .args(["schema", "--job", "rsync_everything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown job 'rsync_everything'"));
}

#[test]
fn test_cli_version_is_parseable() {
    let output = snapsync().arg("--version").output().unwrap();
    assert!(output.status.success());
    let version = snapsync::version::parse_version_output(&String::from_utf8_lossy(&output.stdout));
    assert_eq!(version.map(|v| v.to_string()).as_deref(), Some(snapsync::version::VERSION));
}

#[test]
fn test_cli_sync_with_missing_config_fails() -> Result<()> {
    let dir = tempdir()?;
    snapsync()
        .args(["sync", "backup-host", "--config"])
        .arg(dir.path().join("absent.json"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load configuration"));
    Ok(())
}

#[test]
fn test_cli_rollback_flags_conflict() {
    snapsync()
        .args(["sync", "backup-host", "--yes-rollback", "--no-rollback"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_cli_rollback_requires_session() {
    snapsync()
        .arg("rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--session"));
}
