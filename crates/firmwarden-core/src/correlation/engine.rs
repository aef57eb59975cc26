use std::collections::BTreeSet;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument, trace};

use super::{
    CorrelationPolicy, CorrelationReport, EvidenceRef, Finding, RuleId, ServiceClassifier,
    Severity,
};
use crate::evidence::{Confidence, EvidenceBundle, EvidenceCategory, EvidenceMeta};

static KERNEL_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v?(\d+)(?:\.|$)")
        .expect("kernel version pattern is valid")
});

/// Major version of a kernel release string such as `2.6.36`, `4.14.0-rc1`
/// or a vendor build like `2.6.36.4brcmarm`. Only the leading dot-separated
/// segment must be numeric; anything else yields `None`.
pub fn kernel_major(version: &str) -> Option<u32> {
    let caps = KERNEL_VERSION.captures(version.trim())?;
    caps.get(1)?.as_str().parse().ok()
}

/// Finding confidence never exceeds the weakest contributing input nor the
/// ceiling of the rule that produced it.
fn derive_confidence(ceiling: Confidence, inputs: &[Confidence]) -> Confidence {
    inputs
        .iter()
        .copied()
        .min()
        .unwrap_or(Confidence::Low)
        .min(ceiling)
}

fn cite(category: EvidenceCategory, meta: &EvidenceMeta, facts: Vec<String>) -> EvidenceRef {
    EvidenceRef {
        category,
        confidence: meta.confidence,
        sources: meta.sources.clone(),
        facts,
    }
}

/// Services reported by the bundle, split by classification.
struct ServiceView {
    legacy: BTreeSet<String>,
    authenticated: BTreeSet<String>,
}

impl ServiceView {
    fn remote(&self) -> BTreeSet<String> {
        self.legacy.union(&self.authenticated).cloned().collect()
    }
}

/// Rule-based correlator turning evidence bundles into ranked findings.
///
/// Every rule is evaluated independently and contributes at most one finding;
/// findings come out in [`RuleId::ALL`] order so callers can address them by index.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    policy: CorrelationPolicy,
    classifier: ServiceClassifier,
}

impl CorrelationEngine {
    pub fn new(policy: CorrelationPolicy) -> Result<Self> {
        let classifier = ServiceClassifier::new(&policy)?;
        Ok(Self { policy, classifier })
    }

    pub fn policy(&self) -> &CorrelationPolicy {
        &self.policy
    }

    #[instrument(name = "correlate", skip_all)]
    pub fn correlate(&self, bundle: &EvidenceBundle) -> CorrelationReport {
        let services = self.classify_services(bundle);
        let mut findings = Vec::new();
        for rule in RuleId::ALL {
            let finding = match rule {
                RuleId::RemoteServiceWithCredentials => {
                    self.remote_service_with_credentials(bundle, &services)
                }
                RuleId::InsecureRemoteService => self.insecure_remote_service(bundle, &services),
                RuleId::OutdatedKernel => self.outdated_kernel(bundle),
                RuleId::WeakCryptoWithCredentials => self.weak_crypto_with_credentials(bundle),
                RuleId::DangerousFunctionsInPrivilegedBinaries => {
                    self.dangerous_functions_in_privileged_binaries(bundle)
                }
            };
            if let Some(finding) = finding {
                trace!(?rule, severity = %finding.severity, "rule fired");
                findings.push(finding);
            }
        }
        debug!(findings = findings.len(), "correlation completed");
        CorrelationReport::new(findings)
    }

    fn classify_services(&self, bundle: &EvidenceBundle) -> ServiceView {
        let mut view = ServiceView {
            legacy: BTreeSet::new(),
            authenticated: BTreeSet::new(),
        };
        let Some(services) = &bundle.services else {
            return view;
        };
        for raw in &services.services {
            let name = self.classifier.normalize(raw);
            if self.policy.legacy_services.contains(&name) {
                view.legacy.insert(name);
            } else if self.policy.authenticated_services.contains(&name) {
                view.authenticated.insert(name);
            }
        }
        view
    }

    fn remote_service_with_credentials(
        &self,
        bundle: &EvidenceBundle,
        services: &ServiceView,
    ) -> Option<Finding> {
        let creds = bundle.credentials.as_ref().filter(|c| c.is_present())?;
        let service_meta = &bundle.services.as_ref()?.meta;
        let remote = services.remote();
        if remote.is_empty() {
            return None;
        }

        let severity = if services.legacy.is_empty() {
            Severity::High
        } else {
            Severity::Critical
        };
        let mut components = remote.clone();
        components.insert("credentials".into());
        let service_list = remote.iter().cloned().collect::<Vec<_>>();

        Some(Finding {
            rule: RuleId::RemoteServiceWithCredentials,
            title: "Remote service exposed with embedded credentials".into(),
            severity,
            confidence: derive_confidence(
                Confidence::High,
                &[service_meta.confidence, creds.meta.confidence],
            ),
            attack_vector: "remote".into(),
            components,
            reasoning: format!(
                "Remotely accessible services ({}) were detected together with embedded \
                 credentials. Depending on the service this enables authenticated or \
                 unauthenticated remote compromise.",
                service_list.join(", ")
            ),
            evidence: vec![
                cite(EvidenceCategory::Services, service_meta, service_list),
                cite(
                    EvidenceCategory::Credentials,
                    &creds.meta,
                    creds.artifacts.clone(),
                ),
            ],
        })
    }

    fn insecure_remote_service(
        &self,
        bundle: &EvidenceBundle,
        services: &ServiceView,
    ) -> Option<Finding> {
        if services.legacy.is_empty() {
            return None;
        }
        let service_meta = &bundle.services.as_ref()?.meta;
        let legacy = services.legacy.iter().cloned().collect::<Vec<_>>();

        Some(Finding {
            rule: RuleId::InsecureRemoteService,
            title: "Insecure remote services exposed".into(),
            severity: Severity::High,
            confidence: derive_confidence(Confidence::Medium, &[service_meta.confidence]),
            attack_vector: "remote".into(),
            components: services.legacy.clone(),
            reasoning: format!(
                "Legacy remote services ({}) were detected. These services frequently lack \
                 authentication or ship with weak default configurations.",
                legacy.join(", ")
            ),
            evidence: vec![cite(EvidenceCategory::Services, service_meta, legacy)],
        })
    }

    fn outdated_kernel(&self, bundle: &EvidenceBundle) -> Option<Finding> {
        let kernel = bundle.kernel.as_ref()?;
        let version = kernel.version.as_deref()?;
        let major = kernel_major(version)?;
        if major >= self.policy.kernel_major_threshold || kernel.hardening.nx != Some(false) {
            return None;
        }

        Some(Finding {
            rule: RuleId::OutdatedKernel,
            title: "Outdated kernel with NX disabled".into(),
            severity: Severity::High,
            confidence: derive_confidence(Confidence::Medium, &[kernel.meta.confidence]),
            attack_vector: "local/remote".into(),
            components: BTreeSet::from(["kernel".to_string()]),
            reasoning: format!(
                "Kernel {version} predates the {}.x series and runs without NX protection, \
                 which significantly reduces exploit complexity.",
                self.policy.kernel_major_threshold
            ),
            evidence: vec![cite(
                EvidenceCategory::Kernel,
                &kernel.meta,
                vec![format!("version={version}"), "nx=false".into()],
            )],
        })
    }

    fn weak_crypto_with_credentials(&self, bundle: &EvidenceBundle) -> Option<Finding> {
        let crypto = bundle.crypto.as_ref().filter(|c| c.has_weak_algorithms())?;
        let creds = bundle.credentials.as_ref().filter(|c| c.is_present())?;
        let algorithms = crypto
            .algorithm_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        Some(Finding {
            rule: RuleId::WeakCryptoWithCredentials,
            title: "Weak cryptography used for credential storage".into(),
            severity: Severity::High,
            confidence: derive_confidence(
                Confidence::Medium,
                &[crypto.meta.confidence, creds.meta.confidence],
            ),
            attack_vector: "offline".into(),
            components: BTreeSet::from(["crypto".to_string(), "credentials".to_string()]),
            reasoning: format!(
                "Weak cryptographic primitives ({}) were detected alongside stored \
                 credentials, enabling offline attacks.",
                algorithms.join(", ")
            ),
            evidence: vec![
                cite(EvidenceCategory::Crypto, &crypto.meta, algorithms),
                cite(
                    EvidenceCategory::Credentials,
                    &creds.meta,
                    creds.artifacts.clone(),
                ),
            ],
        })
    }

    fn dangerous_functions_in_privileged_binaries(
        &self,
        bundle: &EvidenceBundle,
    ) -> Option<Finding> {
        let functions = bundle.functions.as_ref().filter(|f| !f.calls.is_empty())?;
        let privileges = bundle
            .privileges
            .as_ref()
            .filter(|p| !p.suid_binaries.is_empty())?;
        let called = functions
            .calls
            .iter()
            .map(|call| call.function.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        Some(Finding {
            rule: RuleId::DangerousFunctionsInPrivilegedBinaries,
            title: "Dangerous functions in privileged binaries".into(),
            severity: Severity::Critical,
            confidence: derive_confidence(
                Confidence::High,
                &[functions.meta.confidence, privileges.meta.confidence],
            ),
            attack_vector: "local".into(),
            components: BTreeSet::from([
                "binary".to_string(),
                "privilege escalation".to_string(),
            ]),
            reasoning: "Unsafe C library functions were detected while privileged (SUID) \
                        binaries are present, enabling reliable local privilege escalation."
                .into(),
            evidence: vec![
                cite(EvidenceCategory::Functions, &functions.meta, called),
                cite(
                    EvidenceCategory::Privileges,
                    &privileges.meta,
                    privileges.suid_binaries.clone(),
                ),
            ],
        })
    }
}
