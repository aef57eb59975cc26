use std::{collections::BTreeSet, fmt, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::evidence::{Confidence, EvidenceCategory, EvidenceProvider};

pub mod attack_path;
pub mod engine;
pub mod policy;

pub use attack_path::{AttackPathExplainer, AttackPathExplanation, AttackPattern, AttackerEffort};
pub use engine::CorrelationEngine;
pub use policy::{CorrelationPolicy, ServiceClassifier};

/// Severity of a correlated finding; `Critical` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation rules in evaluation order. Findings are emitted in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    RemoteServiceWithCredentials,
    InsecureRemoteService,
    OutdatedKernel,
    WeakCryptoWithCredentials,
    DangerousFunctionsInPrivilegedBinaries,
}

impl RuleId {
    pub const ALL: [RuleId; 5] = [
        RuleId::RemoteServiceWithCredentials,
        RuleId::InsecureRemoteService,
        RuleId::OutdatedKernel,
        RuleId::WeakCryptoWithCredentials,
        RuleId::DangerousFunctionsInPrivilegedBinaries,
    ];
}

/// Citation of the evidence record a finding was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub category: EvidenceCategory,
    pub confidence: Confidence,
    /// Provenance paths reported by the provider.
    pub sources: Vec<String>,
    /// Short identifiers of the facts that triggered the rule (service names, flags, binaries).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<String>,
}

/// A correlated security conclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: RuleId,
    pub title: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub attack_vector: String,
    pub components: BTreeSet<String>,
    pub evidence: Vec<EvidenceRef>,
    pub reasoning: String,
}

impl Finding {
    pub fn has_component(&self, component: &str) -> bool {
        self.components.contains(component)
    }
}

/// Output of one correlation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub count: usize,
    pub findings: Vec<Finding>,
}

impl CorrelationReport {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            count: findings.len(),
            findings,
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Confidence marker carried by boundary error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorConfidence {
    Error,
    Low,
}

/// Structured error shape returned across the public boundary instead of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub confidence: ErrorConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_findings: Option<usize>,
}

impl ErrorPayload {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            confidence: ErrorConfidence::Error,
            available_findings: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("evidence collection failed: {0}")]
    Evidence(String),
}

impl AnalysisError {
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::error(self.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExplainError {
    #[error("{0}")]
    Upstream(String),
    #[error("No high-risk findings available")]
    NoFindings,
    #[error("Invalid finding index {index}")]
    InvalidIndex { index: usize, available: usize },
}

impl ExplainError {
    pub fn payload(&self) -> ErrorPayload {
        match self {
            ExplainError::Upstream(_) => ErrorPayload::error(self.to_string()),
            ExplainError::NoFindings => ErrorPayload {
                error: self.to_string(),
                confidence: ErrorConfidence::Low,
                available_findings: None,
            },
            ExplainError::InvalidIndex { available, .. } => ErrorPayload {
                error: self.to_string(),
                confidence: ErrorConfidence::Error,
                available_findings: Some(*available),
            },
        }
    }
}

impl From<AnalysisError> for ExplainError {
    fn from(err: AnalysisError) -> Self {
        ExplainError::Upstream(err.to_string())
    }
}

/// Collect evidence for `log_dir` and correlate it. Provider failures never
/// yield partial results.
pub async fn analyze<P>(
    provider: &P,
    engine: &CorrelationEngine,
    log_dir: &Path,
) -> Result<CorrelationReport, AnalysisError>
where
    P: EvidenceProvider + ?Sized,
{
    let bundle = provider.collect(log_dir).await.map_err(|err| {
        warn!(log_dir = %log_dir.display(), error = %format!("{err:#}"), "evidence provider failed");
        AnalysisError::Evidence(format!("{err:#}"))
    })?;
    Ok(engine.correlate(&bundle))
}

/// Correlate `log_dir` and explain the finding at `index`.
pub async fn explain_attack_path<P>(
    provider: &P,
    engine: &CorrelationEngine,
    explainer: &AttackPathExplainer,
    log_dir: &Path,
    index: usize,
) -> Result<AttackPathExplanation, ExplainError>
where
    P: EvidenceProvider + ?Sized,
{
    let report = analyze(provider, engine, log_dir).await?;
    explainer.explain(&report.findings, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{
        CredentialEvidence, EvidenceBundle, EvidenceMeta, ServiceEvidence, StaticEvidenceProvider,
    };
    use anyhow::anyhow;
    use serde_json::json;

    struct FailingProvider;

    #[async_trait::async_trait]
    impl EvidenceProvider for FailingProvider {
        async fn collect(&self, _log_dir: &Path) -> anyhow::Result<crate::evidence::EvidenceBundle> {
            Err(anyhow!("log directory unreadable"))
        }
    }

    fn telnet_with_credentials() -> EvidenceBundle {
        EvidenceBundle {
            services: Some(ServiceEvidence {
                services: vec!["telnet".into()],
                ..Default::default()
            }),
            credentials: Some(CredentialEvidence {
                meta: EvidenceMeta {
                    found: true,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn explain_error_payloads_carry_markers() {
        let payload = serde_json::to_value(ExplainError::NoFindings.payload()).unwrap();
        assert_eq!(
            payload,
            json!({ "error": "No high-risk findings available", "confidence": "low" })
        );

        let payload = serde_json::to_value(
            ExplainError::InvalidIndex {
                index: 5,
                available: 2,
            }
            .payload(),
        )
        .unwrap();
        assert_eq!(payload["available_findings"], json!(2));
        assert_eq!(payload["confidence"], json!("error"));
        assert!(payload["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid finding index"));
    }

    #[tokio::test]
    async fn provider_failure_becomes_error_payload() {
        let engine = CorrelationEngine::new(CorrelationPolicy::default()).unwrap();
        let err = analyze(&FailingProvider, &engine, Path::new("/logs"))
            .await
            .unwrap_err();
        let payload = err.payload();
        assert_eq!(payload.confidence, ErrorConfidence::Error);
        assert!(payload.error.contains("log directory unreadable"));
    }

    #[tokio::test]
    async fn explain_propagates_upstream_errors() {
        let policy = CorrelationPolicy::default();
        let engine = CorrelationEngine::new(policy.clone()).unwrap();
        let explainer = AttackPathExplainer::new(&policy);
        let err = explain_attack_path(&FailingProvider, &engine, &explainer, Path::new("/logs"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::Upstream(ref msg) if msg.contains("unreadable")));
        assert_eq!(err.payload().confidence, ErrorConfidence::Error);
    }

    #[tokio::test]
    async fn analyze_and_explain_through_provider() {
        let policy = CorrelationPolicy::default();
        let engine = CorrelationEngine::new(policy.clone()).unwrap();
        let explainer = AttackPathExplainer::new(&policy);
        let provider = StaticEvidenceProvider::new(telnet_with_credentials());

        let report = analyze(&provider, &engine, Path::new("/logs")).await.unwrap();
        assert_eq!(report.count, 2);
        assert_eq!(report.highest_severity(), Some(Severity::Critical));

        let explanation =
            explain_attack_path(&provider, &engine, &explainer, Path::new("/logs"), 0)
                .await
                .unwrap();
        assert_eq!(explanation.pattern, AttackPattern::RemoteAuthenticatedAccess);
    }
}
