use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_shows_usage() {
    let mut cmd = Command::cargo_bin("stratum-proxy").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Stratum mining proxy"));
}

#[test]
fn version_shows_version() {
    let mut cmd = Command::cargo_bin("stratum-proxy").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn create_config_writes_file() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("proxy.toml");
    let mut cmd = Command::cargo_bin("stratum-proxy").unwrap();
    cmd.arg("create-config")
        .arg("--output")
        .arg(output.to_str().unwrap())
        .arg("--env")
        .arg("production")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration file created"));

    let content = std::fs::read_to_string(&output).unwrap();
    assert!(content.contains("[[stratum]]"));
    assert!(content.contains("0.0.0.0:8009"));
}

#[test]
fn check_config_accepts_created_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("proxy.toml");
    Command::cargo_bin("stratum-proxy")
        .unwrap()
        .arg("create-config")
        .arg("--output")
        .arg(path.to_str().unwrap())
        .assert()
        .success();

    let mut cmd = Command::cargo_bin("stratum-proxy").unwrap();
    cmd.arg("--config")
        .arg(path.to_str().unwrap())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("127.0.0.1:8008"));
}

#[test]
fn check_config_rejects_missing_file() {
    let temp = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("stratum-proxy").unwrap();
    cmd.arg("--config")
        .arg(temp.path().join("missing.toml").to_str().unwrap())
        .arg("check-config")
        .assert()
        .failure();
}
