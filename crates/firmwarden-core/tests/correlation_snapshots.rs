use std::path::PathBuf;

use firmwarden_core::{
    analyze, correlation::AttackPattern, explain_attack_path, AttackPathExplainer,
    BundleFileProvider, CorrelationEngine, CorrelationPolicy, ErrorConfidence, ExplainError,
};
use insta::assert_json_snapshot;
use serde_json::json;

fn fixture_dir(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn tooling() -> (CorrelationEngine, AttackPathExplainer) {
    let policy = CorrelationPolicy::default();
    let engine = CorrelationEngine::new(policy.clone()).expect("default policy builds");
    (engine, AttackPathExplainer::new(&policy))
}

async fn summarize(name: &str) -> serde_json::Value {
    let (engine, _) = tooling();
    let report = analyze(&BundleFileProvider::new(), &engine, &fixture_dir(name))
        .await
        .unwrap_or_else(|err| panic!("analysis failed for fixture {name}: {err}"));

    json!({
        "count": report.count,
        "findings": report.findings.iter().map(|finding| json!({
            "rule": finding.rule,
            "severity": finding.severity,
            "confidence": finding.confidence,
            "components": finding.components,
        })).collect::<Vec<_>>(),
    })
}

#[tokio::test(flavor = "current_thread")]
async fn router_with_every_weakness_snapshot() {
    let snapshot = summarize("router_full").await;
    assert_json_snapshot!(snapshot, @r###"
    {
      "count": 5,
      "findings": [
        {
          "components": [
            "credentials",
            "ssh",
            "telnet"
          ],
          "confidence": "medium",
          "rule": "remote_service_with_credentials",
          "severity": "critical"
        },
        {
          "components": [
            "telnet"
          ],
          "confidence": "medium",
          "rule": "insecure_remote_service",
          "severity": "high"
        },
        {
          "components": [
            "kernel"
          ],
          "confidence": "medium",
          "rule": "outdated_kernel",
          "severity": "high"
        },
        {
          "components": [
            "credentials",
            "crypto"
          ],
          "confidence": "low",
          "rule": "weak_crypto_with_credentials",
          "severity": "high"
        },
        {
          "components": [
            "binary",
            "privilege escalation"
          ],
          "confidence": "high",
          "rule": "dangerous_functions_in_privileged_binaries",
          "severity": "critical"
        }
      ]
    }
    "###);
}

#[tokio::test(flavor = "current_thread")]
async fn every_router_finding_maps_to_a_narrative() {
    let (engine, explainer) = tooling();
    let provider = BundleFileProvider::new();
    let dir = fixture_dir("router_full");

    let mut patterns = Vec::new();
    for index in 0..5 {
        let explanation = explain_attack_path(&provider, &engine, &explainer, &dir, index)
            .await
            .unwrap_or_else(|err| panic!("index {index} failed: {err}"));
        patterns.push(explanation.pattern);
    }
    assert_eq!(
        patterns,
        vec![
            AttackPattern::RemoteAuthenticatedAccess,
            AttackPattern::ContextDependent,
            AttackPattern::KernelPrivilegeEscalation,
            AttackPattern::OfflineKeyRecovery,
            AttackPattern::LocalPrivilegeEscalation,
        ]
    );

    let err = explain_attack_path(&provider, &engine, &explainer, &dir, 5)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ExplainError::InvalidIndex {
            index: 5,
            available: 5
        }
    );
}

#[tokio::test(flavor = "current_thread")]
async fn hardened_camera_yields_no_findings() {
    let snapshot = summarize("camera_yaml").await;
    assert_eq!(snapshot, json!({ "count": 0, "findings": [] }));

    let (engine, explainer) = tooling();
    let err = explain_attack_path(
        &BundleFileProvider::new(),
        &engine,
        &explainer,
        &fixture_dir("camera_yaml"),
        0,
    )
    .await
    .unwrap_err();
    assert_eq!(err, ExplainError::NoFindings);
    assert_eq!(err.payload().confidence, ErrorConfidence::Low);
}

#[tokio::test(flavor = "current_thread")]
async fn missing_bundle_is_an_error_payload() {
    let (engine, _) = tooling();
    let err = analyze(
        &BundleFileProvider::new(),
        &engine,
        &fixture_dir("does_not_exist"),
    )
    .await
    .unwrap_err();
    let payload = serde_json::to_value(err.payload()).unwrap();
    assert_eq!(payload["confidence"], json!("error"));
    assert!(payload["error"]
        .as_str()
        .unwrap()
        .contains("no evidence bundle found"));
}
