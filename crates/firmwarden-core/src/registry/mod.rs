use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlation::ErrorPayload;

pub mod signal;
pub mod store;

pub use store::{JsonFileStore, MemoryStore, RecordMap, RegistryStore, StoreError};

pub type ScanId = String;

/// Lifecycle state of a scan. `Finished` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Stopping,
    Finished,
    Failed,
}

impl ScanStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Finished | ScanStatus::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Stopping => "stopping",
            ScanStatus::Finished => "finished",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: ScanId,
    pub firmware: PathBuf,
    pub log_dir: PathBuf,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set exactly when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Last pid attached to the scan. Informational only, never signaled after a restart.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub force_overwrite: bool,
}

/// Live OS process backing a running scan. Held in memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

/// Result of a successful `stop_scan` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM was delivered to the process group.
    Stopping { pgid: i32 },
    /// The scan was not running; nothing was done.
    Unchanged { status: ScanStatus },
}

impl StopOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            StopOutcome::Stopping { .. } => ScanStatus::Stopping,
            StopOutcome::Unchanged { status } => *status,
        }
    }

    pub fn pgid(&self) -> Option<i32> {
        match self {
            StopOutcome::Stopping { pgid } => Some(*pgid),
            StopOutcome::Unchanged { .. } => None,
        }
    }
}

impl Serialize for StopOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Reply {
            status: ScanStatus,
            #[serde(skip_serializing_if = "Option::is_none")]
            pgid: Option<i32>,
        }
        Reply {
            status: self.status(),
            pgid: self.pgid(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown scan_id `{0}`")]
    UnknownScan(ScanId),
    #[error("no process attached to scan `{0}`")]
    NoProcessAttached(ScanId),
    #[error("failed to signal process group of scan `{scan_id}`: {source}")]
    Signal {
        scan_id: ScanId,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Persist(#[from] StoreError),
}

impl RegistryError {
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::error(self.to_string())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    records: RecordMap,
    processes: HashMap<ScanId, ProcessHandle>,
    // Scans this registry created or changed. Only these are written back.
    owned: BTreeSet<ScanId>,
}

impl RegistryState {
    fn owned_records(&self) -> RecordMap {
        self.owned
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }
}

/// Durable, thread-safe bookkeeping of scan lifecycles.
///
/// A single lock serializes every read, every mutation and the snapshot
/// write that follows it. Live process handles sit in a side table that is
/// never handed to the store. Writes carry only the scans this registry
/// touched and are merged into the stored snapshot, so several registries
/// may share one store.
pub struct ScanRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn RegistryStore>,
}

impl fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScanRegistry")
            .field("records", &state.records.len())
            .field("live_processes", &state.processes.len())
            .finish()
    }
}

impl ScanRegistry {
    /// Load the registry from `store`. A missing or unreadable snapshot yields an empty registry.
    pub fn open(store: Arc<dyn RegistryStore>) -> Self {
        let records = match store.load() {
            Ok(Some(records)) => records,
            Ok(None) => RecordMap::new(),
            Err(err) => {
                warn!(error = %err, "discarding unreadable scan registry; starting empty");
                RecordMap::new()
            }
        };
        let orphaned = records.values().filter(|r| !r.status.is_terminal()).count();
        if orphaned > 0 {
            info!(orphaned, "loaded scans without a live process handle");
        }
        debug!(records = records.len(), "scan registry loaded");
        Self {
            state: Mutex::new(RegistryState {
                records,
                processes: HashMap::new(),
                owned: BTreeSet::new(),
            }),
            store,
        }
    }

    /// Registry persisted to a JSON file at `path`.
    pub fn open_file(path: impl AsRef<Path>) -> Self {
        Self::open(Arc::new(JsonFileStore::new(path.as_ref())))
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryStore::new()))
    }

    pub fn create_scan(
        &self,
        firmware: &Path,
        log_dir: &Path,
        force_overwrite: bool,
    ) -> Result<ScanId, RegistryError> {
        let mut state = self.state.lock();
        let scan_id = loop {
            let candidate = new_scan_id();
            if !state.records.contains_key(&candidate) {
                break candidate;
            }
        };
        state.records.insert(
            scan_id.clone(),
            ScanRecord {
                scan_id: scan_id.clone(),
                firmware: firmware.to_path_buf(),
                log_dir: log_dir.to_path_buf(),
                status: ScanStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
                pid: None,
                force_overwrite,
            },
        );
        state.owned.insert(scan_id.clone());
        if let Err(err) = self.persist(&mut state) {
            state.records.remove(&scan_id);
            state.owned.remove(&scan_id);
            return Err(err);
        }
        info!(scan_id = %scan_id, firmware = %firmware.display(), "scan registered");
        Ok(scan_id)
    }

    /// Remember the live process of a scan. Unknown or finished scans are ignored.
    pub fn attach_process(&self, scan_id: &str, handle: ProcessHandle) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(scan_id) else {
            warn!(scan_id, "attach_process on unknown scan ignored");
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(scan_id, status = %record.status, "attach_process on terminal scan ignored");
            return Ok(());
        }
        record.pid = Some(handle.pid);
        state.processes.insert(scan_id.to_string(), handle);
        state.owned.insert(scan_id.to_string());
        debug!(scan_id, pid = handle.pid, "process attached");
        self.persist(&mut state)
    }

    pub fn mark_finished(&self, scan_id: &str) -> Result<(), RegistryError> {
        self.finish(scan_id, ScanStatus::Finished, None)
    }

    pub fn mark_failed(&self, scan_id: &str, error: impl Into<String>) -> Result<(), RegistryError> {
        self.finish(scan_id, ScanStatus::Failed, Some(error.into()))
    }

    fn finish(
        &self,
        scan_id: &str,
        status: ScanStatus,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(scan_id) else {
            warn!(scan_id, %status, "terminal transition on unknown scan ignored");
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(scan_id, current = %record.status, requested = %status, "scan already terminal");
            return Ok(());
        }
        record.status = status;
        record.error = error;
        record.finished_at = Some(Utc::now());
        state.processes.remove(scan_id);
        state.owned.insert(scan_id.to_string());
        info!(scan_id, %status, "scan reached terminal state");
        self.persist(&mut state)
    }

    pub fn get_scan(&self, scan_id: &str) -> Result<ScanRecord, RegistryError> {
        self.state
            .lock()
            .records
            .get(scan_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownScan(scan_id.to_string()))
    }

    pub fn list_scans(&self) -> BTreeMap<ScanId, ScanRecord> {
        self.state.lock().records.clone()
    }

    pub fn has_live_process(&self, scan_id: &str) -> bool {
        self.state.lock().processes.contains_key(scan_id)
    }

    /// Ask a running scan to stop by signaling its whole process group.
    ///
    /// Stopping a scan that is no longer running returns its status unchanged.
    /// The final status is recorded later, when the process exit is observed.
    pub fn stop_scan(&self, scan_id: &str) -> Result<StopOutcome, RegistryError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get(scan_id)
            .ok_or_else(|| RegistryError::UnknownScan(scan_id.to_string()))?;
        if record.status != ScanStatus::Running {
            return Ok(StopOutcome::Unchanged {
                status: record.status,
            });
        }
        let handle = state
            .processes
            .get(scan_id)
            .copied()
            .ok_or_else(|| RegistryError::NoProcessAttached(scan_id.to_string()))?;

        let pgid = signal::terminate_process_group(handle.pid).map_err(|source| {
            RegistryError::Signal {
                scan_id: scan_id.to_string(),
                source,
            }
        })?;
        if let Some(record) = state.records.get_mut(scan_id) {
            record.status = ScanStatus::Stopping;
        }
        state.owned.insert(scan_id.to_string());
        info!(scan_id, pid = handle.pid, pgid, "sent SIGTERM to scan process group");
        self.persist(&mut state)?;
        Ok(StopOutcome::Stopping { pgid })
    }

    /// Write this registry's scans and pick up scans stored by others. Used on teardown.
    pub fn flush(&self) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        self.persist(&mut state)
    }

    fn persist(&self, state: &mut RegistryState) -> Result<(), RegistryError> {
        let merged = self.store.merge(&state.owned_records()).map_err(|err| {
            warn!(error = %err, "failed to persist scan registry");
            RegistryError::Persist(err)
        })?;
        state.records = merged;
        Ok(())
    }
}

fn new_scan_id() -> ScanId {
    let token = Uuid::new_v4().simple().to_string();
    format!("scan-{}", &token[..16])
}
