use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use firmwarden_core::{AnalyzerSettings, CorrelationPolicy};
use serde::Deserialize;

const STATE_DIR_ENV: &str = "FIRMWARDEN_STATE_DIR";
const REGISTRY_FILE: &str = "scan_registry.json";

/// Layered CLI configuration: optional file, then `FIRMWARDEN__*` variables.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub analyzer: AnalyzerSection,
    pub registry: RegistrySection,
    pub policy: CorrelationPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    pub home: Option<PathBuf>,
    pub binary: Option<String>,
    pub profile: Option<PathBuf>,
    pub home_env: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub path: Option<PathBuf>,
}

impl AnalyzerSection {
    /// Overlay configured values on top of `base`.
    pub fn apply(&self, base: AnalyzerSettings) -> AnalyzerSettings {
        AnalyzerSettings {
            home: self.home.clone().or(base.home),
            binary: self.binary.clone().unwrap_or(base.binary),
            profile: self.profile.clone().unwrap_or(base.profile),
            home_env: self.home_env.clone().unwrap_or(base.home_env),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("FIRMWARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| match path {
                Some(path) => format!("failed to load configuration from {}", path.display()),
                None => "failed to load configuration from environment".to_string(),
            })?;
        settings
            .try_deserialize()
            .context("configuration has an invalid shape")
    }

    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        self.analyzer.apply(AnalyzerSettings::from_env())
    }

    /// `--registry`, then `[registry] path`, then the state directory default.
    pub fn registry_path(&self, cli_override: Option<&Path>) -> PathBuf {
        let state_dir = std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .filter(|dir| !dir.as_os_str().is_empty());
        self.registry_path_with(cli_override, state_dir)
    }

    fn registry_path_with(&self, cli_override: Option<&Path>, state_dir: Option<PathBuf>) -> PathBuf {
        if let Some(path) = cli_override {
            return path.to_path_buf();
        }
        if let Some(path) = &self.registry.path {
            return path.clone();
        }
        state_dir
            .unwrap_or_else(|| PathBuf::from("state"))
            .join(REGISTRY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_sections_from_toml() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        fs::write(
            file.path(),
            r#"
[analyzer]
home = "/opt/emba"
binary = "emba.sh"

[registry]
path = "/var/lib/firmwarden/registry.json"

[policy]
kernel_major_threshold = 5
legacy_services = ["telnet", "ftp", "tftp", "rlogin"]
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.policy.kernel_major_threshold, 5);
        assert!(config.policy.is_legacy("rlogin"));
        assert!(config.policy.authenticated_services.contains("ssh"));
        assert_eq!(
            config.registry_path_with(None, None),
            PathBuf::from("/var/lib/firmwarden/registry.json")
        );

        let settings = config.analyzer.apply(AnalyzerSettings::default());
        assert_eq!(settings.home, Some(PathBuf::from("/opt/emba")));
        assert_eq!(settings.binary, "emba.sh");
        assert_eq!(
            settings.profile,
            PathBuf::from("scan-profiles/default-scan.emba")
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to load configuration"));
    }

    #[test]
    fn registry_path_precedence() {
        let config = AppConfig::default();
        assert_eq!(
            config.registry_path_with(None, None),
            PathBuf::from("state/scan_registry.json")
        );
        assert_eq!(
            config.registry_path_with(None, Some(PathBuf::from("/srv/state"))),
            PathBuf::from("/srv/state/scan_registry.json")
        );
        assert_eq!(
            config.registry_path_with(
                Some(Path::new("/tmp/override.json")),
                Some(PathBuf::from("/srv/state"))
            ),
            PathBuf::from("/tmp/override.json")
        );
    }

    #[test]
    fn empty_section_keeps_base_settings() {
        let base = AnalyzerSettings {
            home: Some(PathBuf::from("/from/env")),
            ..AnalyzerSettings::default()
        };
        let merged = AnalyzerSection::default().apply(base.clone());
        assert_eq!(merged, base);
    }
}
