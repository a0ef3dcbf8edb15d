#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn partmap(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("partmap");
    cmd.arg("--dir").arg(dir).arg("--backup");
    cmd
}

#[test]
fn put_checkpoint_get() {
    let dir = TempDir::new().expect("tempdir");
    partmap(dir.path()).args(["put", "7", "seven"]).assert().success();
    partmap(dir.path()).args(["put", "7", "+more", "--append"]).assert().success();
    let output = partmap(dir.path())
        .args(["checkpoint"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "horizon 1");

    let output = partmap(dir.path())
        .args(["get", "7"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(output, b"seven+more");

    let output = partmap(dir.path())
        .args(["get", "7", "--hex"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), hex::encode("seven+more"));

    partmap(dir.path()).args(["get", "8"]).assert().code(2);
}

#[test]
fn status_as_json() {
    let dir = TempDir::new().expect("tempdir");
    partmap(dir.path()).args(["put", "1", "x"]).assert().success();
    let output = partmap(dir.path())
        .args(["--format", "json", "status", "--prefix", "db"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["db.smap.partitions"], "1");
    assert_eq!(json["db.smap.checkpoint"], "live");
    assert!(json["db.tile.capacity"].is_string());
}

#[test]
fn remove_backup_and_rollback() {
    let dir = TempDir::new().expect("tempdir");
    partmap(dir.path()).args(["put", "3", "three"]).assert().success();
    partmap(dir.path()).args(["checkpoint", "--soft"]).assert().success();
    assert!(dir.path().join("smapbackup").is_dir());
    partmap(dir.path()).args(["rollback"]).assert().success();
    partmap(dir.path()).args(["remove-backup"]).assert().success();
    assert!(!dir.path().join("smapbackup").exists());
    partmap(dir.path())
        .args(["--config", "missing.toml", "status"])
        .assert()
        .failure();
}

#[test]
fn add_builds_an_id_set() {
    let dir = TempDir::new().expect("tempdir");
    partmap(dir.path()).args(["add", "3", "10"]).assert().success();
    partmap(dir.path()).args(["add", "3", "11", "--exclusive"]).assert().success();
    partmap(dir.path())
        .args(["add", "3", "10", "--exclusive"])
        .assert()
        .failure();

    let output = partmap(dir.path())
        .args(["ids", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output), "10\n11\n");

    let output = partmap(dir.path())
        .args(["--format", "json", "ids", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let ids: Vec<u64> = serde_json::from_slice(&output).expect("json");
    assert_eq!(ids, vec![10, 11]);
}
