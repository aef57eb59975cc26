use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use super::{ScanId, ScanRecord};

pub type RecordMap = BTreeMap<ScanId, ScanRecord>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registry store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry store at {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode registry snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("registry store unavailable: {0}")]
    Unavailable(String),
}

/// Durable backend holding the serializable registry snapshot.
pub trait RegistryStore: Send + Sync {
    /// Load the last snapshot. `Ok(None)` means nothing has been stored yet.
    fn load(&self) -> Result<Option<RecordMap>, StoreError>;

    /// Overlay `changed` onto the stored snapshot and return the combined records.
    ///
    /// Records stored by other writers are kept; records in `changed` replace
    /// stored ones with the same id.
    fn merge(&self, changed: &RecordMap) -> Result<RecordMap, StoreError>;
}

/// Pretty-printed JSON file shared by every process pointed at the same path.
///
/// Writers serialize on an advisory lock held on a sibling `.lock` file and
/// re-read the file before rewriting it, so concurrent `firmwarden` processes
/// never drop each other's scans.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "scan_registry.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn write(&self, records: &RecordMap) -> Result<(), StoreError> {
        let encoded = serde_json::to_string_pretty(records).map_err(StoreError::Encode)?;
        // Write-then-rename keeps the previous snapshot intact if we die mid-write.
        let temp = self.temp_path();
        fs::write(&temp, encoded).map_err(|err| self.io_error(&temp, err))?;
        fs::rename(&temp, &self.path).map_err(|err| self.io_error(&self.path, err))
    }

    fn io_error(&self, path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Option<RecordMap>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&self.path, err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    fn merge(&self, changed: &RecordMap) -> Result<RecordMap, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(parent, err))?;
        }
        let lock_path = self.lock_path();
        let _lock = FileLock::acquire(&lock_path).map_err(|err| self.io_error(&lock_path, err))?;

        let mut records = match self.load() {
            Ok(stored) => stored.unwrap_or_default(),
            Err(err @ StoreError::Decode { .. }) => {
                warn!(error = %err, "overwriting unreadable scan registry");
                RecordMap::new()
            }
            Err(err) => return Err(err),
        };
        records.extend(changed.iter().map(|(id, record)| (id.clone(), record.clone())));
        self.write(&records)?;
        Ok(records)
    }
}

/// Exclusive advisory lock, released when the guard is dropped.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // Closing the descriptor releases the lock.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

/// In-process store, used by tests and by embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Option<RecordMap>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordMap) -> Self {
        Self {
            records: Mutex::new(Some(records)),
            ..Self::default()
        }
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail, simulating a broken disk.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<RecordMap> {
        self.records.lock().clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Option<RecordMap>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn merge(&self, changed: &RecordMap) -> Result<RecordMap, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        let mut stored = self.records.lock();
        let records = stored.get_or_insert_with(RecordMap::new);
        records.extend(changed.iter().map(|(id, record)| (id.clone(), record.clone())));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ScanStatus;
    use chrono::{TimeZone, Utc};

    fn record(id: &str) -> ScanRecord {
        ScanRecord {
            scan_id: id.into(),
            firmware: PathBuf::from("/fw/router.bin"),
            log_dir: PathBuf::from(format!("/logs/{id}")),
            status: ScanStatus::Finished,
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            finished_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()),
            error: None,
            pid: Some(4242),
            force_overwrite: false,
        }
    }

    #[test]
    fn json_store_round_trips_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("state/scan_registry.json");
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_none());

        let records = RecordMap::from([("scan-a".to_string(), record("scan-a"))]);
        assert_eq!(store.merge(&records).unwrap(), records);

        assert_eq!(store.load().unwrap(), Some(records));
        assert!(!store.temp_path().exists());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"scan-a\""));
    }

    #[test]
    fn json_store_keeps_records_written_by_other_stores() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("scan_registry.json");
        let first = JsonFileStore::new(&path);
        let second = JsonFileStore::new(&path);

        first
            .merge(&RecordMap::from([("scan-a".to_string(), record("scan-a"))]))
            .unwrap();
        let mut updated = record("scan-b");
        updated.status = ScanStatus::Failed;
        second
            .merge(&RecordMap::from([("scan-b".to_string(), updated.clone())]))
            .unwrap();
        let mut replaced = record("scan-a");
        replaced.error = Some("rewritten".into());
        let merged = first
            .merge(&RecordMap::from([("scan-a".to_string(), replaced.clone())]))
            .unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["scan-a"], replaced);
        assert_eq!(merged["scan-b"], updated);
        assert_eq!(JsonFileStore::new(&path).load().unwrap(), Some(merged));
        assert!(first.lock_path().exists());
    }

    #[test]
    fn json_store_overwrites_a_corrupt_file_on_merge() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("scan_registry.json");
        fs::write(&path, "{ truncated").unwrap();
        let store = JsonFileStore::new(&path);
        let records = RecordMap::from([("scan-a".to_string(), record("scan-a"))]);
        assert_eq!(store.merge(&records).unwrap(), records);
        assert_eq!(store.load().unwrap(), Some(records));
    }

    #[test]
    fn json_store_reports_corruption() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("scan_registry.json");
        fs::write(&path, "{ truncated").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[test]
    fn memory_store_can_simulate_failures() {
        let store = MemoryStore::new();
        store.merge(&RecordMap::new()).unwrap();
        assert_eq!(store.save_count(), 1);
        store.set_fail_saves(true);
        assert!(store.merge(&RecordMap::new()).is_err());
        assert_eq!(store.save_count(), 1);
    }
}
