//! Durable queues for batches awaiting transmission

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::models::{BatchKind, SyncBatch};

/// Persistence for queued samples, one ordered queue per [`BatchKind`].
pub trait BatchStore: Send {
    /// Append the samples of `batch` to the queue of its kind, creating it if needed.
    fn append(&mut self, batch: &SyncBatch) -> Result<(), StorageError>;

    /// Everything queued for `kind`, oldest first. Empty when nothing is queued.
    fn retrieve(&self, kind: BatchKind) -> Result<SyncBatch, StorageError>;

    fn clear(&mut self, kind: BatchKind) -> Result<(), StorageError>;

    /// Remove the oldest `count` samples of `kind`.
    fn truncate_front(&mut self, kind: BatchKind, count: usize) -> Result<(), StorageError> {
        let remaining = self.retrieve(kind)?.skip_front(count);
        self.clear(kind)?;
        if !remaining.is_empty() {
            self.append(&remaining)?;
        }
        Ok(())
    }
}

/// Concatenate two batches of the same kind.
fn merged(queued: SyncBatch, more: &SyncBatch) -> SyncBatch {
    match (queued, more) {
        (SyncBatch::Beacons(mut fixes), SyncBatch::Beacons(extra)) => {
            fixes.extend_from_slice(extra);
            SyncBatch::Beacons(fixes)
        }
        (SyncBatch::Locations(mut fixes), SyncBatch::Locations(extra)) => {
            fixes.extend_from_slice(extra);
            SyncBatch::Locations(fixes)
        }
        // Queues are keyed by kind, so the variants always agree
        (_, more) => more.clone(),
    }
}

/// In-memory queues. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: HashMap<BatchKind, SyncBatch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchStore for MemoryStore {
    fn append(&mut self, batch: &SyncBatch) -> Result<(), StorageError> {
        let kind = batch.kind();
        let queued = self
            .queues
            .remove(&kind)
            .unwrap_or_else(|| SyncBatch::empty(kind));
        self.queues.insert(kind, merged(queued, batch));
        Ok(())
    }

    fn retrieve(&self, kind: BatchKind) -> Result<SyncBatch, StorageError> {
        Ok(self
            .queues
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| SyncBatch::empty(kind)))
    }

    fn clear(&mut self, kind: BatchKind) -> Result<(), StorageError> {
        self.queues.remove(&kind);
        Ok(())
    }
}

/// One JSON array file per kind inside a cache directory.
///
/// Every write goes to a temporary file that is then renamed over the
/// queue file, so a crash mid-write leaves the previous queue readable.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Batch store at {}", dir.display());
        Ok(JsonFileStore { dir })
    }

    pub fn path(&self, kind: BatchKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind))
    }

    fn write(&self, batch: &SyncBatch) -> Result<(), StorageError> {
        let path = self.path(batch.kind());
        match batch {
            SyncBatch::Beacons(fixes) => write_array(&path, fixes),
            SyncBatch::Locations(fixes) => write_array(&path, fixes),
        }
    }
}

impl BatchStore for JsonFileStore {
    fn append(&mut self, batch: &SyncBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let queued = self.retrieve(batch.kind())?;
        self.write(&merged(queued, batch))
    }

    fn retrieve(&self, kind: BatchKind) -> Result<SyncBatch, StorageError> {
        let path = self.path(kind);
        Ok(match kind {
            BatchKind::Beacons => SyncBatch::Beacons(read_array(&path)?),
            BatchKind::Locations => SyncBatch::Locations(read_array(&path)?),
        })
    }

    fn clear(&mut self, kind: BatchKind) -> Result<(), StorageError> {
        match fs::remove_file(self.path(kind)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_front(&mut self, kind: BatchKind, count: usize) -> Result<(), StorageError> {
        let remaining = self.retrieve(kind)?.skip_front(count);
        if remaining.is_empty() {
            self.clear(kind)
        } else {
            self.write(&remaining)
        }
    }
}

/// Read a queue file. A file that no longer decodes is moved aside to
/// `*.json.corrupt` and the queue starts over empty.
fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(items) => Ok(items),
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            warn!(
                "Unreadable queue {} ({}), moving it to {}",
                path.display(),
                e,
                aside.display()
            );
            fs::rename(path, &aside)?;
            Ok(Vec::new())
        }
    }
}

fn write_array<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(items)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BeaconFix, BeaconKey, LocationFix, Proximity};
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    fn locations(n: usize) -> SyncBatch {
        let ts = datetime!(2024-03-01 12:00 UTC);
        SyncBatch::Locations(
            (0..n)
                .map(|i| LocationFix::at(48.0 + i as f64 * 0.001, 16.0, ts))
                .collect(),
        )
    }

    fn beacon_batch() -> SyncBatch {
        SyncBatch::Beacons(vec![BeaconFix {
            key: BeaconKey::new("f7826da6-4fa2-4e98-8024-bc5b71e0893e", 1, 2),
            rssi: -64.5,
            proximity: Proximity::Near,
            samples: 4,
            timestamp: datetime!(2024-03-01 12:00:09 UTC),
        }])
    }

    fn exercise(store: &mut dyn BatchStore) {
        assert!(store.retrieve(BatchKind::Locations).unwrap().is_empty());

        store.append(&locations(2)).unwrap();
        store.append(&locations(3)).unwrap();
        store.append(&beacon_batch()).unwrap();
        assert_eq!(store.retrieve(BatchKind::Locations).unwrap().len(), 5);
        assert_eq!(store.retrieve(BatchKind::Beacons).unwrap(), beacon_batch());

        store.truncate_front(BatchKind::Locations, 2).unwrap();
        let rest = store.retrieve(BatchKind::Locations).unwrap();
        assert_eq!(rest, locations(3));

        store.clear(BatchKind::Locations).unwrap();
        store.clear(BatchKind::Locations).unwrap();
        assert!(store.retrieve(BatchKind::Locations).unwrap().is_empty());
        // other kind untouched
        assert_eq!(store.retrieve(BatchKind::Beacons).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&mut MemoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&mut JsonFileStore::new(dir.path()).unwrap());
    }

    #[test]
    fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = JsonFileStore::new(dir.path()).unwrap();
            store.append(&beacon_batch()).unwrap();
        }
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert_eq!(store.retrieve(BatchKind::Beacons).unwrap(), beacon_batch());
        assert!(store.path(BatchKind::Beacons).ends_with("beacons.json"));
        assert!(!dir.path().join("beacons.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path()).unwrap();
        fs::write(store.path(BatchKind::Locations), b"{trunc").unwrap();

        assert!(store.retrieve(BatchKind::Locations).unwrap().is_empty());
        assert!(dir.path().join("locations.json.corrupt").exists());

        store.append(&locations(1)).unwrap();
        store.append(&locations(2)).unwrap();
        assert_eq!(store.retrieve(BatchKind::Locations).unwrap().len(), 3);
    }

    #[test]
    fn test_append_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path()).unwrap();
        fs::write(store.path(BatchKind::Beacons), b"[{\"uuid\":").unwrap();

        store.append(&beacon_batch()).unwrap();
        assert_eq!(store.retrieve(BatchKind::Beacons).unwrap(), beacon_batch());
    }

    #[test]
    fn test_truncate_everything_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path()).unwrap();
        store.append(&locations(2)).unwrap();
        store.truncate_front(BatchKind::Locations, 5).unwrap();
        assert!(!store.path(BatchKind::Locations).exists());
    }
}
