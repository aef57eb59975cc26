use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{CorrelationPolicy, ExplainError, Finding, Severity};
use crate::evidence::Confidence;

/// Narrative families, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackPattern {
    RemoteAuthenticatedAccess,
    KernelPrivilegeEscalation,
    LocalPrivilegeEscalation,
    OfflineKeyRecovery,
    ContextDependent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackerEffort {
    Low,
    Medium,
    High,
}

impl AttackerEffort {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttackerEffort::Low => "low",
            AttackerEffort::Medium => "medium",
            AttackerEffort::High => "high",
        }
    }
}

/// Exploit narrative for a single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackPathExplanation {
    pub title: String,
    pub pattern: AttackPattern,
    pub attack_vector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<String>,
    pub exploit_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker_effort: Option<AttackerEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    pub severity: Severity,
    pub confidence: Confidence,
    pub rationale: String,
}

/// Maps findings onto exploit narratives using a fixed pattern library.
#[derive(Debug, Clone)]
pub struct AttackPathExplainer {
    legacy_services: BTreeSet<String>,
    remote_services: BTreeSet<String>,
}

impl AttackPathExplainer {
    pub fn new(policy: &CorrelationPolicy) -> Self {
        Self {
            legacy_services: policy.legacy_services.clone(),
            remote_services: policy
                .remote_services()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Explain `findings[index]`. The index is never clamped.
    pub fn explain(
        &self,
        findings: &[Finding],
        index: usize,
    ) -> Result<AttackPathExplanation, ExplainError> {
        if findings.is_empty() {
            return Err(ExplainError::NoFindings);
        }
        let finding = findings.get(index).ok_or(ExplainError::InvalidIndex {
            index,
            available: findings.len(),
        })?;
        Ok(self.explain_finding(finding))
    }

    pub fn explain_finding(&self, finding: &Finding) -> AttackPathExplanation {
        if let Some(service) = self.authenticatable_service(finding) {
            return self.remote_access(finding, service);
        }
        if finding.has_component("kernel") {
            return kernel_escalation(finding);
        }
        if finding.has_component("binary") && finding.has_component("privilege escalation") {
            return local_escalation(finding);
        }
        if finding.has_component("crypto") && finding.has_component("credentials") {
            return offline_key_recovery(finding);
        }
        context_dependent(finding)
    }

    /// The service an attacker would log into, preferring legacy services.
    fn authenticatable_service<'a>(&self, finding: &'a Finding) -> Option<&'a str> {
        if !finding.has_component("credentials") {
            return None;
        }
        let remote: Vec<&'a String> = finding
            .components
            .iter()
            .filter(|c| self.remote_services.contains(c.as_str()))
            .collect();
        remote
            .iter()
            .copied()
            .find(|c| self.legacy_services.contains(c.as_str()))
            .or_else(|| remote.first().copied())
            .map(String::as_str)
    }

    fn remote_access(&self, finding: &Finding, service: &str) -> AttackPathExplanation {
        let legacy = self.legacy_services.contains(service);
        let (exploit_class, impact, rationale) = if legacy {
            (
                "authentication bypass / remote shell access",
                "Full device compromise",
                format!(
                    "{service} transmits credentials in cleartext and exposes direct device \
                     access. Combined with embedded credentials this allows trivial compromise \
                     of the device."
                ),
            )
        } else {
            (
                "authenticated remote access",
                "Remote access with the privileges of the credentialed account",
                format!(
                    "{service} is reachable over the network and embedded or default \
                     credentials were recovered from the image, so authentication offers \
                     little protection."
                ),
            )
        };
        AttackPathExplanation {
            title: finding.title.clone(),
            pattern: AttackPattern::RemoteAuthenticatedAccess,
            attack_vector: "remote".into(),
            entry_point: Some(format!("{service} service")),
            preconditions: vec![
                "Network access to the device".into(),
                "Valid or default credentials".into(),
            ],
            exploit_class: exploit_class.into(),
            attacker_effort: Some(AttackerEffort::Low),
            impact: Some(impact.into()),
            severity: finding.severity,
            confidence: finding.confidence,
            rationale,
        }
    }
}

fn kernel_escalation(finding: &Finding) -> AttackPathExplanation {
    AttackPathExplanation {
        title: finding.title.clone(),
        pattern: AttackPattern::KernelPrivilegeEscalation,
        attack_vector: "local or remote".into(),
        entry_point: Some("kernel memory corruption vulnerability".into()),
        preconditions: vec!["Ability to trigger kernel code paths".into()],
        exploit_class: "kernel privilege escalation / RCE".into(),
        attacker_effort: Some(AttackerEffort::Medium),
        impact: Some("Root access to device".into()),
        severity: finding.severity,
        confidence: finding.confidence.min(Confidence::Medium),
        rationale: "Outdated kernels without modern hardening significantly reduce the \
                    complexity and cost of exploitation."
            .into(),
    }
}

fn local_escalation(finding: &Finding) -> AttackPathExplanation {
    AttackPathExplanation {
        title: finding.title.clone(),
        pattern: AttackPattern::LocalPrivilegeEscalation,
        attack_vector: "local".into(),
        entry_point: Some("privileged binary execution".into()),
        preconditions: vec!["Ability to execute local binaries".into()],
        exploit_class: "local privilege escalation".into(),
        attacker_effort: Some(AttackerEffort::Medium),
        impact: Some("Root privileges".into()),
        severity: finding.severity,
        confidence: finding.confidence,
        rationale: "Unsafe libc calls inside privileged binaries let attackers hijack \
                    execution flow and escalate privileges."
            .into(),
    }
}

fn offline_key_recovery(finding: &Finding) -> AttackPathExplanation {
    AttackPathExplanation {
        title: finding.title.clone(),
        pattern: AttackPattern::OfflineKeyRecovery,
        attack_vector: "offline".into(),
        entry_point: Some("extracted firmware image".into()),
        preconditions: vec![
            "Copy of the firmware image or its filesystem".into(),
            "Commodity password cracking hardware".into(),
        ],
        exploit_class: "offline credential and key recovery".into(),
        attacker_effort: Some(AttackerEffort::Medium),
        impact: Some("Recovered credentials reusable across every deployed device".into()),
        severity: finding.severity,
        confidence: finding.confidence.min(Confidence::Medium),
        rationale: "Credentials protected by weak primitives can be brute-forced offline \
                    without ever touching a live device."
            .into(),
    }
}

fn context_dependent(finding: &Finding) -> AttackPathExplanation {
    AttackPathExplanation {
        title: finding.title.clone(),
        pattern: AttackPattern::ContextDependent,
        attack_vector: finding.attack_vector.clone(),
        entry_point: None,
        preconditions: Vec::new(),
        exploit_class: "context-dependent".into(),
        attacker_effort: None,
        impact: None,
        severity: finding.severity,
        confidence: finding.confidence,
        rationale: "This finding represents a combination of weaknesses whose exploitability \
                    depends on runtime conditions."
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::RuleId;

    fn finding(components: &[&str], confidence: Confidence) -> Finding {
        Finding {
            rule: RuleId::RemoteServiceWithCredentials,
            title: "test finding".into(),
            severity: Severity::High,
            confidence,
            attack_vector: "network".into(),
            components: components.iter().map(|c| c.to_string()).collect(),
            evidence: Vec::new(),
            reasoning: String::new(),
        }
    }

    fn explainer() -> AttackPathExplainer {
        AttackPathExplainer::new(&CorrelationPolicy::default())
    }

    #[test]
    fn empty_findings_report_low_confidence_error() {
        let err = explainer().explain(&[], 0).unwrap_err();
        assert_eq!(err, ExplainError::NoFindings);
        assert_eq!(
            err.payload().confidence,
            crate::correlation::ErrorConfidence::Low
        );
    }

    #[test]
    fn out_of_range_index_reports_available_count() {
        let findings = vec![
            finding(&["kernel"], Confidence::High),
            finding(&["sbom"], Confidence::Low),
        ];
        let err = explainer().explain(&findings, 5).unwrap_err();
        assert_eq!(
            err,
            ExplainError::InvalidIndex {
                index: 5,
                available: 2
            }
        );
        assert_eq!(err.payload().available_findings, Some(2));
    }

    #[test]
    fn telnet_and_credentials_explain_remote_shell() {
        let explanation =
            explainer().explain_finding(&finding(&["credentials", "telnet"], Confidence::High));
        assert_eq!(explanation.pattern, AttackPattern::RemoteAuthenticatedAccess);
        assert_eq!(explanation.entry_point.as_deref(), Some("telnet service"));
        assert_eq!(explanation.attacker_effort, Some(AttackerEffort::Low));
        assert_eq!(explanation.confidence, Confidence::High);
    }

    #[test]
    fn effort_labels_match_serialized_names() {
        for effort in [AttackerEffort::Low, AttackerEffort::Medium, AttackerEffort::High] {
            assert_eq!(
                serde_json::to_value(effort).unwrap(),
                serde_json::json!(effort.as_str())
            );
        }
    }

    #[test]
    fn legacy_service_is_preferred_entry_point() {
        let explanation = explainer().explain_finding(&finding(
            &["credentials", "ftp", "http", "ssh"],
            Confidence::Medium,
        ));
        assert_eq!(explanation.entry_point.as_deref(), Some("ftp service"));
        assert_eq!(
            explanation.exploit_class,
            "authentication bypass / remote shell access"
        );
    }

    #[test]
    fn ssh_with_credentials_is_authenticated_access() {
        let explanation =
            explainer().explain_finding(&finding(&["credentials", "ssh"], Confidence::High));
        assert_eq!(explanation.entry_point.as_deref(), Some("ssh service"));
        assert_eq!(explanation.exploit_class, "authenticated remote access");
    }

    #[test]
    fn service_without_credentials_is_not_remote_access() {
        let explanation = explainer().explain_finding(&finding(&["telnet"], Confidence::Medium));
        assert_eq!(explanation.pattern, AttackPattern::ContextDependent);
    }

    #[test]
    fn kernel_explanation_caps_confidence() {
        let explanation = explainer().explain_finding(&finding(&["kernel"], Confidence::High));
        assert_eq!(explanation.pattern, AttackPattern::KernelPrivilegeEscalation);
        assert_eq!(explanation.confidence, Confidence::Medium);
    }

    #[test]
    fn privileged_binary_explains_local_escalation() {
        let explanation = explainer().explain_finding(&finding(
            &["binary", "privilege escalation"],
            Confidence::High,
        ));
        assert_eq!(explanation.pattern, AttackPattern::LocalPrivilegeEscalation);
        assert_eq!(explanation.attack_vector, "local");
    }

    #[test]
    fn crypto_and_credentials_explain_offline_recovery() {
        let explanation =
            explainer().explain_finding(&finding(&["credentials", "crypto"], Confidence::Low));
        assert_eq!(explanation.pattern, AttackPattern::OfflineKeyRecovery);
        assert_eq!(explanation.confidence, Confidence::Low);
    }

    #[test]
    fn unmatched_components_fall_back_to_finding_fields() {
        let explanation = explainer().explain_finding(&finding(&["sbom"], Confidence::Medium));
        assert_eq!(explanation.pattern, AttackPattern::ContextDependent);
        assert_eq!(explanation.exploit_class, "context-dependent");
        assert_eq!(explanation.attack_vector, "network");
        assert_eq!(explanation.severity, Severity::High);
        assert_eq!(explanation.confidence, Confidence::Medium);
        assert!(explanation.entry_point.is_none());
    }
}
