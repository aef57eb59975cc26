use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod bundle_file;

/// Confidence attached to evidence records and to the findings derived from them.
///
/// Ordered so that `Low < Medium < High`; unrecognised labels emitted by
/// scanners (`unknown`, `raw`, ...) collapse to `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub const fn as_str(self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl From<String> for Confidence {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields every evidence provider is expected to emit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMeta {
    #[serde(default)]
    pub found: bool,
    /// Some providers report `detected` instead of `found`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected: Option<bool>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl EvidenceMeta {
    pub fn is_found(&self) -> bool {
        self.found || self.detected.unwrap_or(false)
    }
}

/// Evidence categories a finding can cite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceCategory {
    Services,
    Credentials,
    Kernel,
    Crypto,
    Functions,
    Privileges,
}

impl EvidenceCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            EvidenceCategory::Services => "services",
            EvidenceCategory::Credentials => "credentials",
            EvidenceCategory::Kernel => "kernel",
            EvidenceCategory::Crypto => "crypto",
            EvidenceCategory::Functions => "functions",
            EvidenceCategory::Privileges => "privileges",
        }
    }
}

/// Network services detected in the firmware image (`ssh`, `telnet`, `lighttpd`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default, alias = "services_detected")]
    pub services: Vec<String>,
}

/// Credential artifacts (passwd/shadow entries, keys, config secrets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl CredentialEvidence {
    pub fn is_present(&self) -> bool {
        self.meta.is_found()
    }
}

/// Kernel hardening switches. `None` means the scanner could not tell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelHardening {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nx: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aslr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_canary: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default, alias = "kernel_version")]
    pub version: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub hardening: KernelHardening,
}

/// Weak crypto indicators keyed by the file they were found in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default)]
    pub weak_algorithms: BTreeMap<String, Vec<String>>,
}

impl CryptoEvidence {
    pub fn algorithm_names(&self) -> BTreeSet<&str> {
        self.weak_algorithms
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn has_weak_algorithms(&self) -> bool {
        self.weak_algorithms.values().any(|algos| !algos.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerousCall {
    pub function: String,
    pub binary: String,
}

/// Dangerous libc calls (`strcpy`, `system`, ...) located in firmware binaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerousFunctionEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default, alias = "dangerous_calls")]
    pub calls: Vec<DangerousCall>,
}

/// Binaries carrying SUID/SGID bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeEvidence {
    #[serde(flatten)]
    pub meta: EvidenceMeta,
    #[serde(default)]
    pub suid_binaries: Vec<String>,
}

/// Resolved evidence for one scan output directory.
///
/// Records the rules do not consume (SBOM, PHP findings, ...) are kept
/// verbatim in `extra` so a bundle survives a load/save cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServiceEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<DangerousFunctionEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileges: Option<PrivilegeEvidence>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Source of evidence for a scan output directory.
///
/// The scanners that turn raw tool logs into evidence live outside this
/// crate; they plug in through this trait.
#[async_trait]
pub trait EvidenceProvider: Send + Sync {
    /// Collect the evidence bundle for the given log directory.
    async fn collect(&self, log_dir: &Path) -> AnyResult<EvidenceBundle>;
}

/// Provider that hands out a fixed bundle regardless of the directory.
#[derive(Debug, Clone, Default)]
pub struct StaticEvidenceProvider {
    bundle: EvidenceBundle,
}

impl StaticEvidenceProvider {
    pub fn new(bundle: EvidenceBundle) -> Self {
        Self { bundle }
    }
}

#[async_trait]
impl EvidenceProvider for StaticEvidenceProvider {
    async fn collect(&self, _log_dir: &Path) -> AnyResult<EvidenceBundle> {
        Ok(self.bundle.clone())
    }
}
