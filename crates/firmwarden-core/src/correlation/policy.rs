use std::collections::{BTreeMap, BTreeSet};

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Classification tables and thresholds consulted by the correlation rules.
///
/// The defaults reproduce the historical behaviour: kernels older than 4.x
/// count as outdated, telnet/ftp/tftp are legacy services and ssh/http/https
/// are authenticated remote services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationPolicy {
    /// Kernels whose major version is strictly below this value are outdated.
    pub kernel_major_threshold: u32,
    /// Unauthenticated or legacy remote services.
    pub legacy_services: BTreeSet<String>,
    /// Remote services that normally require authentication.
    pub authenticated_services: BTreeSet<String>,
    /// Daemon or binary names mapped to their canonical service.
    pub service_aliases: BTreeMap<String, String>,
}

impl Default for CorrelationPolicy {
    fn default() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        let aliases = [
            ("dropbear", "ssh"),
            ("sshd", "ssh"),
            ("telnetd", "telnet"),
            ("lighttpd", "http"),
            ("uhttpd", "http"),
            ("httpd", "http"),
            ("ftpd", "ftp"),
            ("vsftpd", "ftp"),
            ("tftpd", "tftp"),
        ];
        Self {
            kernel_major_threshold: 4,
            legacy_services: set(&["telnet", "ftp", "tftp"]),
            authenticated_services: set(&["ssh", "http", "https"]),
            service_aliases: aliases
                .iter()
                .map(|(alias, service)| (alias.to_string(), service.to_string()))
                .collect(),
        }
    }
}

impl CorrelationPolicy {
    pub fn is_legacy(&self, service: &str) -> bool {
        self.legacy_services.contains(service)
    }

    /// Every service an attacker could authenticate against remotely.
    pub fn remote_services(&self) -> BTreeSet<&str> {
        self.legacy_services
            .iter()
            .chain(self.authenticated_services.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Maps raw service names reported by scanners onto canonical service names.
#[derive(Debug, Clone)]
pub struct ServiceClassifier {
    canonical: BTreeSet<String>,
    automaton: Option<(AhoCorasick, Vec<String>)>,
}

impl ServiceClassifier {
    pub fn new(policy: &CorrelationPolicy) -> Result<Self> {
        let canonical = policy
            .legacy_services
            .iter()
            .chain(policy.authenticated_services.iter())
            .map(|s| s.to_ascii_lowercase())
            .collect();
        let automaton = if policy.service_aliases.is_empty() {
            None
        } else {
            let (patterns, targets): (Vec<_>, Vec<_>) = policy
                .service_aliases
                .iter()
                .map(|(alias, service)| (alias.to_ascii_lowercase(), service.to_ascii_lowercase()))
                .unzip();
            let automaton = AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&patterns)
                .context("failed to build service alias automaton")?;
            Some((automaton, targets))
        };
        Ok(Self {
            canonical,
            automaton,
        })
    }

    /// Canonical name for `raw`, or the lower-cased input when no alias applies.
    pub fn normalize(&self, raw: &str) -> String {
        let name = raw.trim().to_ascii_lowercase();
        if self.canonical.contains(&name) {
            return name;
        }
        if let Some((automaton, targets)) = &self.automaton {
            if let Some(found) = automaton.find(&name) {
                return targets[found.pattern().as_usize()].clone();
            }
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_daemon_names() {
        let classifier = ServiceClassifier::new(&CorrelationPolicy::default()).unwrap();
        assert_eq!(classifier.normalize("Telnet"), "telnet");
        assert_eq!(classifier.normalize("busybox telnetd"), "telnet");
        assert_eq!(classifier.normalize("tftpd"), "tftp");
        assert_eq!(classifier.normalize("lighttpd"), "http");
        assert_eq!(classifier.normalize("dropbear"), "ssh");
        assert_eq!(classifier.normalize("upnp"), "upnp");
    }

    #[test]
    fn remote_services_union_both_sets() {
        let policy = CorrelationPolicy::default();
        let remote: Vec<_> = policy.remote_services().into_iter().collect();
        assert_eq!(remote, vec!["ftp", "http", "https", "ssh", "telnet", "tftp"]);
        assert!(policy.is_legacy("telnet"));
        assert!(!policy.is_legacy("ssh"));
    }

    #[test]
    fn partial_policy_falls_back_to_defaults() {
        let policy: CorrelationPolicy =
            serde_json::from_str(r#"{ "kernel_major_threshold": 5 }"#).unwrap();
        assert_eq!(policy.kernel_major_threshold, 5);
        assert!(policy.is_legacy("ftp"));
    }

    #[test]
    fn classifier_without_aliases_only_lowercases() {
        let policy = CorrelationPolicy {
            service_aliases: BTreeMap::new(),
            ..CorrelationPolicy::default()
        };
        let classifier = ServiceClassifier::new(&policy).unwrap();
        assert_eq!(classifier.normalize(" TelnetD "), "telnetd");
    }
}
