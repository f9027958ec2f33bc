/// Threshold-based flushing of the durable queues
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

use crate::config::{FlushThreshold, SyncConfig};
use crate::error::{StorageError, TransportError};
use crate::models::{BatchKind, BeaconFix, HostState, LocationFix, SyncBatch};
use crate::sync::store::BatchStore;
use crate::utils::{elapsed, format_datetime};

/// Queues reported samples and decides when each kind should be sent.
///
/// A batch handed out by [`due_batches`](Self::due_batches) is in flight until
/// [`complete`](Self::complete) is called for its kind; no second batch of that
/// kind is handed out meanwhile. Only the samples that were actually sent are
/// removed on success, so anything appended while a batch was in flight stays
/// queued.
pub struct SyncBuffer {
    config: SyncConfig,
    store: Box<dyn BatchStore>,
    last_sent: HashMap<BatchKind, OffsetDateTime>,
    in_flight: HashSet<BatchKind>,
}

impl SyncBuffer {
    pub fn new(config: SyncConfig, store: Box<dyn BatchStore>) -> Self {
        Self {
            config,
            store,
            last_sent: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn append_beacons(&mut self, fixes: &[BeaconFix]) -> Result<(), StorageError> {
        if fixes.is_empty() {
            return Ok(());
        }
        self.store.append(&SyncBatch::Beacons(fixes.to_vec()))
    }

    pub fn append_location(&mut self, fix: &LocationFix) -> Result<(), StorageError> {
        self.store.append(&SyncBatch::Locations(vec![fix.clone()]))
    }

    pub fn queued(&self, kind: BatchKind) -> Result<SyncBatch, StorageError> {
        self.store.retrieve(kind)
    }

    pub fn queued_len(&self, kind: BatchKind) -> usize {
        self.store.retrieve(kind).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_in_flight(&self, kind: BatchKind) -> bool {
        self.in_flight.contains(&kind)
    }

    pub fn last_sent(&self, kind: BatchKind) -> Option<OffsetDateTime> {
        self.last_sent.get(&kind).copied()
    }

    /// Thresholds that apply to `kind` while the host is in `host` state.
    pub fn threshold(&self, host: HostState, kind: BatchKind) -> FlushThreshold {
        let policy = match host {
            HostState::Foreground => self.config.foreground,
            HostState::Background => self.config.background,
        };
        match kind {
            BatchKind::Beacons => policy.beacons,
            BatchKind::Locations => policy.locations,
        }
    }

    /// Batches that should be transmitted now. Each returned kind is marked in flight.
    ///
    /// `force` ignores the thresholds but still skips empty queues and kinds
    /// already in flight.
    pub fn due_batches(
        &mut self,
        host: HostState,
        now: OffsetDateTime,
        force: bool,
    ) -> Vec<SyncBatch> {
        let mut due = Vec::new();
        for kind in BatchKind::ALL {
            if self.in_flight.contains(&kind) {
                debug!("{} batch already in flight", kind);
                continue;
            }

            let batch = match self.store.retrieve(kind) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Failed to read queued {}: {}", kind, e);
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            if force || self.exceeds(kind, host, now, batch.len()) {
                debug!("Flushing {} queued {}", batch.len(), kind);
                self.in_flight.insert(kind);
                due.push(batch);
            }
        }
        due
    }

    /// Record the outcome of sending the oldest `sent` samples of `kind`.
    pub fn complete(
        &mut self,
        kind: BatchKind,
        sent: usize,
        result: &Result<(), TransportError>,
        now: OffsetDateTime,
    ) {
        self.in_flight.remove(&kind);
        match result {
            Ok(()) => {
                if let Err(e) = self.store.truncate_front(kind, sent) {
                    error!("Failed to drop {} sent {}: {}", sent, kind, e);
                }
                self.last_sent.insert(kind, now);
                info!(
                    "Synced {} {} at {}",
                    sent,
                    kind,
                    format_datetime(&now)
                );
            }
            Err(e) => {
                warn!("Sync of {} {} failed, keeping queue: {}", sent, kind, e);
            }
        }
    }

    fn exceeds(&self, kind: BatchKind, host: HostState, now: OffsetDateTime, queued: usize) -> bool {
        let threshold = self.threshold(host, kind);
        match self.last_sent.get(&kind) {
            // Never sent in this process
            None => true,
            Some(last) => elapsed(*last, now) > threshold.max_age || queued > threshold.max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::{JsonFileStore, MemoryStore};
    use std::fs;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    fn fix(i: usize) -> LocationFix {
        LocationFix::at(48.0 + i as f64 * 0.001, 16.0, T0)
    }

    fn buffer() -> SyncBuffer {
        SyncBuffer::new(SyncConfig::default(), Box::new(MemoryStore::new()))
    }

    #[test]
    fn test_failed_send_keeps_everything_queued() {
        let mut buffer = buffer();
        for i in 0..7 {
            buffer.append_location(&fix(i)).unwrap();
        }

        let due = buffer.due_batches(HostState::Foreground, T0, true);
        assert_eq!(due.len(), 1);
        let failure = Err(TransportError::Connection("offline".to_string()));
        buffer.complete(BatchKind::Locations, due[0].len(), &failure, T0);
        assert_eq!(buffer.queued_len(BatchKind::Locations), 7);
        assert!(!buffer.is_in_flight(BatchKind::Locations));
        assert_eq!(buffer.last_sent(BatchKind::Locations), None);

        // Retried on the next trigger
        let due = buffer.due_batches(HostState::Foreground, T0, false);
        assert_eq!(due[0].len(), 7);
        buffer.complete(BatchKind::Locations, 7, &Ok(()), T0);
        assert_eq!(buffer.queued_len(BatchKind::Locations), 0);
        assert_eq!(buffer.last_sent(BatchKind::Locations), Some(T0));
    }

    #[test]
    fn test_never_sent_queue_is_due() {
        let mut buffer = buffer();
        assert!(buffer.due_batches(HostState::Foreground, T0, false).is_empty());

        buffer.append_location(&fix(0)).unwrap();
        let due = buffer.due_batches(HostState::Background, T0, false);
        assert_eq!(due.len(), 1);
        assert!(buffer.is_in_flight(BatchKind::Locations));
    }

    #[test]
    fn test_in_flight_kind_not_handed_out_twice() {
        let mut buffer = buffer();
        buffer.append_location(&fix(0)).unwrap();
        assert_eq!(buffer.due_batches(HostState::Foreground, T0, true).len(), 1);
        assert!(buffer.due_batches(HostState::Foreground, T0, true).is_empty());
    }

    #[test]
    fn test_samples_appended_during_send_survive() {
        let mut buffer = buffer();
        buffer.append_location(&fix(0)).unwrap();
        buffer.append_location(&fix(1)).unwrap();
        let due = buffer.due_batches(HostState::Foreground, T0, true);
        buffer.append_location(&fix(2)).unwrap();

        buffer.complete(BatchKind::Locations, due[0].len(), &Ok(()), T0);
        assert_eq!(
            buffer.queued(BatchKind::Locations).unwrap(),
            SyncBatch::Locations(vec![fix(2)])
        );
    }

    #[test]
    fn test_thresholds_follow_host_state() {
        let mut buffer = buffer();
        buffer.append_location(&fix(0)).unwrap();
        let due = buffer.due_batches(HostState::Foreground, T0, false);
        buffer.complete(BatchKind::Locations, due[0].len(), &Ok(()), T0);

        for i in 0..25 {
            buffer.append_location(&fix(i)).unwrap();
        }
        let soon = T0 + Duration::seconds(30);
        // 25 entries is over the foreground count but under the background one
        assert!(buffer.due_batches(HostState::Background, soon, false).is_empty());
        assert_eq!(buffer.due_batches(HostState::Foreground, soon, false).len(), 1);
    }

    #[test]
    fn test_age_threshold() {
        let mut buffer = buffer();
        buffer.append_location(&fix(0)).unwrap();
        buffer.due_batches(HostState::Foreground, T0, false);
        buffer.complete(BatchKind::Locations, 1, &Ok(()), T0);

        buffer.append_location(&fix(1)).unwrap();
        let fresh = T0 + Duration::seconds(59);
        assert!(buffer.due_batches(HostState::Foreground, fresh, false).is_empty());
        let stale = T0 + Duration::seconds(61);
        assert_eq!(buffer.due_batches(HostState::Foreground, stale, false).len(), 1);
    }

    #[test]
    fn test_send_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let mut buffer = SyncBuffer::new(SyncConfig::default(), Box::new(store));
        for i in 0..3 {
            buffer.append_location(&fix(i)).unwrap();
        }

        let due = buffer.due_batches(HostState::Foreground, T0, false);
        assert_eq!(due.len(), 1);
        buffer.complete(BatchKind::Locations, due[0].len(), &Ok(()), T0);

        let reopened = JsonFileStore::new(dir.path()).unwrap();
        assert!(reopened.retrieve(BatchKind::Locations).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_queue_file_does_not_block_new_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        fs::write(store.path(BatchKind::Locations), b"{trunc").unwrap();
        let mut buffer = SyncBuffer::new(SyncConfig::default(), Box::new(store));

        for i in 0..3 {
            buffer.append_location(&fix(i)).unwrap();
        }
        assert_eq!(buffer.queued_len(BatchKind::Locations), 3);
        assert_eq!(buffer.due_batches(HostState::Foreground, T0, false).len(), 1);
    }
}
