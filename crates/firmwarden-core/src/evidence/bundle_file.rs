use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use super::{EvidenceBundle, EvidenceProvider};

/// File names probed, in order, when a provider is pointed at a directory.
pub const BUNDLE_FILE_NAMES: [&str; 4] = [
    "evidence.json",
    "evidence.yaml",
    "evidence.yml",
    "evidence.json5",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    Json,
    Yaml,
    Json5,
}

impl BundleFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "json5" => Some(Self::Json5),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("no evidence bundle found in {dir} (expected one of: {expected})")]
    BundleMissing { dir: PathBuf, expected: String },
    #[error("unsupported evidence bundle format: {path}")]
    UnsupportedFormat { path: PathBuf },
    #[error("invalid evidence bundle {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Loads a pre-collected evidence bundle from disk.
///
/// Pointed at a file, the file is parsed according to its extension. Pointed
/// at a scan output directory, the first of [`BUNDLE_FILE_NAMES`] present is used.
#[derive(Debug, Clone, Default)]
pub struct BundleFileProvider;

impl BundleFileProvider {
    pub fn new() -> Self {
        Self
    }

    fn locate(&self, target: &Path) -> Result<PathBuf> {
        if target.is_file() {
            return Ok(target.to_path_buf());
        }
        BUNDLE_FILE_NAMES
            .iter()
            .map(|name| target.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                EvidenceError::BundleMissing {
                    dir: target.to_path_buf(),
                    expected: BUNDLE_FILE_NAMES.join(", "),
                }
                .into()
            })
    }

    pub fn load_file(path: &Path) -> Result<EvidenceBundle> {
        let format = BundleFormat::from_path(path).ok_or_else(|| {
            EvidenceError::UnsupportedFormat {
                path: path.to_path_buf(),
            }
        })?;
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read evidence bundle at {}", path.display()))?;
        let parsed: std::result::Result<EvidenceBundle, String> = match format {
            BundleFormat::Json => serde_json::from_str(&raw).map_err(|err| err.to_string()),
            BundleFormat::Yaml => serde_yaml::from_str(&raw).map_err(|err| err.to_string()),
            BundleFormat::Json5 => json5::from_str(&raw).map_err(|err| err.to_string()),
        };
        parsed.map_err(|message| {
            EvidenceError::Parse {
                path: path.to_path_buf(),
                message,
            }
            .into()
        })
    }
}

#[async_trait::async_trait]
impl EvidenceProvider for BundleFileProvider {
    async fn collect(&self, log_dir: &Path) -> Result<EvidenceBundle> {
        let path = self.locate(log_dir)?;
        debug!(path = %path.display(), "loading evidence bundle");
        Self::load_file(&path)
    }
}
