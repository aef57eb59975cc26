use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Location and invocation details of the external analysis tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerSettings {
    /// Installation root. Used as working directory and exported to the tool.
    pub home: Option<PathBuf>,
    /// Executable name, or an absolute path.
    pub binary: String,
    /// Scan profile, relative to `home` unless absolute.
    pub profile: PathBuf,
    /// Environment variable that receives `home` when the tool is launched.
    pub home_env: String,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            home: None,
            binary: "emba".to_string(),
            profile: PathBuf::from("scan-profiles/default-scan.emba"),
            home_env: AnalyzerSettings::HOME_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolConfigError {
    #[error("{var} is not set")]
    HomeNotSet { var: String },
    #[error("{var} does not exist: {}", path.display())]
    HomeMissing { var: String, path: PathBuf },
    #[error("analysis tool not found at: {}", path.display())]
    BinaryNotFound { path: PathBuf },
    #[error("analysis tool is not executable: {}", path.display())]
    NotExecutable { path: PathBuf },
    #[error("scan profile not found: {}", path.display())]
    ProfileNotFound { path: PathBuf },
}

/// Fully validated tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub home: PathBuf,
    pub binary: PathBuf,
    pub profile: PathBuf,
    pub home_env: String,
}

impl ResolvedTool {
    /// Short name used in log lines and failure messages.
    pub fn name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }
}

impl AnalyzerSettings {
    pub const HOME_ENV: &'static str = "EMBA_HOME";
    const BINARY_ENV: &'static str = "FIRMWARDEN_TOOL_BIN";
    const PROFILE_ENV: &'static str = "FIRMWARDEN_SCAN_PROFILE";

    /// Load settings from environment variables.
    ///
    /// * `EMBA_HOME`: tool installation root.
    /// * `FIRMWARDEN_TOOL_BIN`: executable name inside the root (default: `emba`).
    /// * `FIRMWARDEN_SCAN_PROFILE`: scan profile (default: `scan-profiles/default-scan.emba`).
    ///
    /// Nothing is validated here; a missing root only fails the scan that needs it.
    pub fn from_env() -> Self {
        Self::from_map(std::env::vars().collect())
    }

    fn from_map(vars: HashMap<String, String>) -> Self {
        let non_empty = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            home: non_empty(Self::HOME_ENV).map(PathBuf::from),
            binary: non_empty(Self::BINARY_ENV).unwrap_or(defaults.binary),
            profile: non_empty(Self::PROFILE_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.profile),
            home_env: defaults.home_env,
        }
    }

    /// Validate the installation and produce absolute paths for launching.
    pub fn resolve(&self) -> Result<ResolvedTool, ToolConfigError> {
        let raw_home = self.home.as_ref().ok_or_else(|| ToolConfigError::HomeNotSet {
            var: self.home_env.clone(),
        })?;
        let home = raw_home
            .canonicalize()
            .map_err(|_| ToolConfigError::HomeMissing {
                var: self.home_env.clone(),
                path: raw_home.clone(),
            })?;

        let binary = home.join(&self.binary);
        if !binary.is_file() {
            return Err(ToolConfigError::BinaryNotFound { path: binary });
        }
        if !is_executable(&binary) {
            return Err(ToolConfigError::NotExecutable { path: binary });
        }

        let profile = home.join(&self.profile);
        if !profile.is_file() {
            return Err(ToolConfigError::ProfileNotFound { path: profile });
        }

        Ok(ResolvedTool {
            home,
            binary,
            profile,
            home_env: self.home_env.clone(),
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
