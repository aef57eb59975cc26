use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    correlation::ErrorPayload,
    registry::{ProcessHandle, RegistryError, ScanId, ScanRegistry, ScanStatus},
};

pub mod process;
pub mod settings;

pub use process::OutputTail;
pub use settings::{AnalyzerSettings, ResolvedTool, ToolConfigError};

use process::{drain, failure_message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub firmware: PathBuf,
    /// Directory under which a fresh per-scan output directory is created.
    pub log_base: PathBuf,
    pub force_overwrite: bool,
}

/// Immediate reply to a scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStarted {
    pub scan_id: ScanId,
    pub status: ScanStatus,
    pub firmware: PathBuf,
    pub log_dir: PathBuf,
    pub force_overwrite: bool,
    pub started_at: DateTime<Utc>,
}

/// A started scan. Dropping `completion` detaches the background task.
#[derive(Debug)]
pub struct LaunchedScan {
    pub started: ScanStarted,
    pub completion: JoinHandle<ScanStatus>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Firmware not found: {}", .0.display())]
    FirmwareNotFound(PathBuf),
    #[error("Log directory already exists: {}. Set force_overwrite to allow overwrite.", .0.display())]
    OutputDirectoryExists(PathBuf),
    #[error("failed to prepare {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StartError {
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::error(self.to_string())
    }

    fn io(path: &Path, source: io::Error) -> Self {
        StartError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reasons a launched scan ends up `failed`. Only ever reported through the registry.
#[derive(Debug, Error)]
enum ScanFailure {
    #[error(transparent)]
    Config(#[from] ToolConfigError),
    #[error("failed to launch {}: {source}", tool.display())]
    Spawn {
        tool: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed while waiting for {tool}: {source}")]
    Wait {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Exited(String),
}

/// Launches the external analysis tool and drives registry transitions.
#[derive(Debug, Clone)]
pub struct ScanOrchestrator {
    registry: Arc<ScanRegistry>,
    settings: AnalyzerSettings,
}

impl ScanOrchestrator {
    pub fn new(registry: Arc<ScanRegistry>, settings: AnalyzerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<ScanRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Validate inputs, register the scan and start the tool in the background.
    ///
    /// Returns as soon as the record exists. Input errors leave no registry entry.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<LaunchedScan, StartError> {
        let firmware = tokio::fs::canonicalize(&request.firmware)
            .await
            .map_err(|_| StartError::FirmwareNotFound(request.firmware.clone()))?;
        if !tokio::fs::metadata(&firmware)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
        {
            return Err(StartError::FirmwareNotFound(request.firmware));
        }

        tokio::fs::create_dir_all(&request.log_base)
            .await
            .map_err(|err| StartError::io(&request.log_base, err))?;
        let base = tokio::fs::canonicalize(&request.log_base)
            .await
            .map_err(|err| StartError::io(&request.log_base, err))?;

        let log_dir = output_dir_for(&base, &firmware);
        ensure_output_dir(&log_dir, request.force_overwrite).await?;

        let scan_id =
            self.registry
                .create_scan(&firmware, &log_dir, request.force_overwrite)?;
        let record = self.registry.get_scan(&scan_id)?;
        let started = ScanStarted {
            scan_id: scan_id.clone(),
            status: record.status,
            firmware: record.firmware,
            log_dir: record.log_dir,
            force_overwrite: record.force_overwrite,
            started_at: record.started_at,
        };

        let completion = tokio::spawn(run_scan(
            self.registry.clone(),
            self.settings.clone(),
            scan_id,
            firmware,
            log_dir,
            request.force_overwrite,
        ));
        Ok(LaunchedScan {
            started,
            completion,
        })
    }
}

/// `<base>/scan_<firmware stem>_<12 hex>`.
pub fn output_dir_for(base: &Path, firmware: &Path) -> PathBuf {
    let stem: String = firmware
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if stem.is_empty() {
        "firmware".to_string()
    } else {
        stem
    };
    let suffix = Uuid::new_v4().simple().to_string();
    base.join(format!("scan_{stem}_{}", &suffix[..12]))
}

pub async fn ensure_output_dir(path: &Path, force_overwrite: bool) -> Result<(), StartError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|err| StartError::io(path, err))?;
    if exists && !force_overwrite {
        return Err(StartError::OutputDirectoryExists(path.to_path_buf()));
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| StartError::io(path, err))
}

#[instrument(name = "scan", skip_all, fields(scan_id = %scan_id))]
async fn run_scan(
    registry: Arc<ScanRegistry>,
    settings: AnalyzerSettings,
    scan_id: ScanId,
    firmware: PathBuf,
    log_dir: PathBuf,
    force_overwrite: bool,
) -> ScanStatus {
    let outcome = execute(
        &registry,
        &settings,
        &scan_id,
        &firmware,
        &log_dir,
        force_overwrite,
    )
    .await;
    let recorded = match outcome {
        Ok(()) => {
            info!("scan completed successfully");
            registry.mark_finished(&scan_id)
        }
        Err(failure) => {
            warn!(error = %failure, "scan failed");
            registry.mark_failed(&scan_id, failure.to_string())
        }
    };
    if let Err(err) = recorded {
        error!(error = %err, "failed to record scan outcome");
    }
    registry
        .get_scan(&scan_id)
        .map(|record| record.status)
        .unwrap_or(ScanStatus::Failed)
}

async fn execute(
    registry: &ScanRegistry,
    settings: &AnalyzerSettings,
    scan_id: &str,
    firmware: &Path,
    log_dir: &Path,
    force_overwrite: bool,
) -> Result<(), ScanFailure> {
    let tool = settings.resolve()?;
    info!(
        firmware = %firmware.display(),
        log_dir = %log_dir.display(),
        tool = %tool.binary.display(),
        force_overwrite,
        "starting analysis"
    );

    let mut command = Command::new(&tool.binary);
    command
        .arg("-l")
        .arg(log_dir)
        .arg("-f")
        .arg(firmware)
        .arg("-p")
        .arg(&tool.profile)
        .current_dir(&tool.home)
        .env(&tool.home_env, &tool.home)
        .stdin(if force_overwrite {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| ScanFailure::Spawn {
        tool: tool.binary.clone(),
        source,
    })?;
    if let Some(pid) = child.id() {
        if let Err(err) = registry.attach_process(scan_id, ProcessHandle::new(pid)) {
            warn!(pid, error = %err, "process attached but not persisted");
        }
    }

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(drain(out, "stdout", scan_id.to_string())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(drain(err, "stderr", scan_id.to_string())));

    if let Some(mut stdin) = child.stdin.take() {
        // The tool may exit before it reads the confirmation.
        if let Err(err) = stdin.write_all(b"y\n").await {
            debug!(error = %err, "could not confirm overwrite prompt");
        }
        drop(stdin);
    }

    let status = child.wait().await.map_err(|source| ScanFailure::Wait {
        tool: tool.name(),
        source,
    })?;
    let stdout = collect_tail(stdout).await;
    let stderr = collect_tail(stderr).await;
    debug!(%status, "analysis process exited");

    if status.success() {
        Ok(())
    } else {
        Err(ScanFailure::Exited(failure_message(
            &tool.name(),
            status,
            &stdout,
            &stderr,
        )))
    }
}

async fn collect_tail(handle: Option<JoinHandle<OutputTail>>) -> OutputTail {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => OutputTail::default(),
    }
}
