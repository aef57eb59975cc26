use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;

const TELNET_BUNDLE: &str = r#"{
  "services": { "detected": true, "confidence": "high", "services_detected": ["telnetd"] },
  "credentials": { "found": true, "confidence": "high", "artifacts": ["/etc/passwd: admin"] }
}"#;

fn firmwarden() -> Command {
    let mut cmd = Command::cargo_bin("firmwarden").unwrap();
    cmd.env_remove("FIRMWARDEN_STATE_DIR").env("RUST_LOG", "error");
    cmd
}

#[test]
fn findings_lists_correlated_rules() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path().join("evidence.json"), TELNET_BUNDLE).unwrap();

    firmwarden()
        .args(["findings", dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("High-risk findings: 2"))
        .stdout(predicate::str::contains("[0] CRITICAL"))
        .stdout(predicate::str::contains("Insecure remote services exposed"));
}

#[test]
fn findings_json_reports_count() {
    let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write(file.path(), TELNET_BUNDLE).unwrap();

    firmwarden()
        .args(["findings", file.path().to_str().unwrap(), "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\": 2"))
        .stdout(predicate::str::contains("\"severity\": \"critical\""));
}

#[test]
fn missing_bundle_prints_error_payload() {
    let dir = tempfile::tempdir().unwrap();

    firmwarden()
        .args(["findings", dir.path().to_str().unwrap()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"confidence\": \"error\""))
        .stdout(predicate::str::contains("no evidence bundle found"));
}

#[test]
fn explain_describes_remote_access() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path().join("evidence.json"), TELNET_BUNDLE).unwrap();

    firmwarden()
        .args(["explain", dir.path().to_str().unwrap(), "--index", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entry point: telnet service"))
        .stdout(predicate::str::contains("Attacker effort: low"));
}

#[test]
fn explain_rejects_out_of_range_index() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path().join("evidence.json"), TELNET_BUNDLE).unwrap();

    firmwarden()
        .args(["explain", dir.path().to_str().unwrap(), "--index", "5"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Invalid finding index 5"))
        .stdout(predicate::str::contains("\"available_findings\": 2"));
}

#[test]
fn kernel_threshold_comes_from_config() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path().join("evidence.yaml"),
        "kernel:\n  found: true\n  confidence: high\n  kernel_version: 4.9.118\n  hardening:\n    nx: false\n",
    )
    .unwrap();
    let config = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write(config.path(), "[policy]\nkernel_major_threshold = 5\n").unwrap();

    firmwarden()
        .args(["findings", dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("High-risk findings: 0"));

    firmwarden()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "findings",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Outdated kernel with NX disabled"));
}
