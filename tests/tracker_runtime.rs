//! End-to-end tests of a spawned tracker

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::timeout;

use fusion_tracker::{
    AcquisitionSettings, AuthorizationStatus, BatchKind, BatchStore, BeaconProvider,
    EventStream, GpsMode, JsonFileStore, LocationFix, LocationProvider, MotionProvider,
    PositionSource, StaticResolver, SyncBatch, Tracker, TrackerConfig, TrackerError,
    TrackerEvent, Transport, TransportError,
};

const UUID: &str = "f7826da6-4fa2-4e98-8024-bc5b71e0893e";

struct StubLocation {
    status: AuthorizationStatus,
}

impl LocationProvider for StubLocation {
    fn authorization(&self) -> AuthorizationStatus {
        self.status
    }
    fn request_authorization(&mut self) {}
    fn start_precise(&mut self) {}
    fn stop_precise(&mut self) {}
    fn start_low_power(&mut self) {}
    fn stop_low_power(&mut self) {}
    fn configure(&mut self, _settings: AcquisitionSettings) {}
}

#[derive(Clone, Default)]
struct StubBeacons {
    monitored: Arc<Mutex<Vec<String>>>,
}

impl BeaconProvider for StubBeacons {
    fn start_monitoring(&mut self, uuids: &[String]) {
        *self.monitored.lock().unwrap() = uuids.to_vec();
    }
    fn stop_monitoring(&mut self) {
        self.monitored.lock().unwrap().clear();
    }
}

struct StubMotion;

impl MotionProvider for StubMotion {
    fn start_sampling(&mut self, _interval: Duration) {}
    fn stop_sampling(&mut self) {}
}

#[derive(Clone, Default)]
struct RecordingTransport {
    batches: Arc<Mutex<Vec<SyncBatch>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: &SyncBatch) -> Result<(), TransportError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Panics on its first send, succeeds afterwards.
#[derive(Clone, Default)]
struct PanicOnceTransport {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for PanicOnceTransport {
    async fn send(&self, _batch: &SyncBatch) -> Result<(), TransportError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("connection pool poisoned");
        }
        Ok(())
    }
}

fn builder(status: AuthorizationStatus) -> fusion_tracker::TrackerBuilder {
    Tracker::builder(TrackerConfig::default())
        .location_provider(StubLocation { status })
        .beacon_provider(StubBeacons::default())
        .motion_provider(StubMotion)
        .resolver(StaticResolver::new(vec![UUID.to_string()]))
}

async fn next_event(events: &mut EventStream) -> TrackerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn wait_for(events: &mut EventStream, wanted: impl Fn(&TrackerEvent) -> bool) -> TrackerEvent {
    loop {
        let event = next_event(events).await;
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_fix_is_reported_and_synced() {
    let transport = RecordingTransport::default();
    let beacons = StubBeacons::default();
    let monitored = beacons.monitored.clone();
    let builder = Tracker::builder(TrackerConfig::default())
        .location_provider(StubLocation {
            status: AuthorizationStatus::AllowedAlways,
        })
        .beacon_provider(beacons)
        .motion_provider(StubMotion)
        .resolver(StaticResolver::new(vec![UUID.to_string()]))
        .transport(transport.clone());
    let sink = builder.sink();
    let (tracker, mut events) = builder.spawn().unwrap();

    tracker.start_tracking().unwrap();
    assert_eq!(next_event(&mut events).await, TrackerEvent::TrackingStarted);
    assert_eq!(
        next_event(&mut events).await,
        TrackerEvent::GpsModeChanged(GpsMode::LowPower)
    );

    let fix = LocationFix::at(60.1699, 24.9384, OffsetDateTime::now_utc());
    sink.location(fix.clone()).unwrap();

    let position = wait_for(&mut events, |e| matches!(e, TrackerEvent::PositionChanged { .. })).await;
    assert_eq!(
        position,
        TrackerEvent::PositionChanged {
            fix: fix.clone(),
            source: PositionSource::Device,
        }
    );

    let synced = wait_for(&mut events, |e| matches!(e, TrackerEvent::SyncCompleted { .. })).await;
    assert_eq!(
        synced,
        TrackerEvent::SyncCompleted {
            kind: BatchKind::Locations,
            count: 1,
        }
    );
    assert_eq!(
        transport.batches.lock().unwrap().clone(),
        vec![SyncBatch::Locations(vec![fix])]
    );

    tracker.shutdown().await.unwrap();
    assert!(monitored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_panicking_transport_fails_batch_and_retries() {
    let transport = PanicOnceTransport::default();
    let builder = builder(AuthorizationStatus::AllowedAlways).transport(transport.clone());
    let sink = builder.sink();
    let (tracker, mut events) = builder.spawn().unwrap();

    tracker.start_tracking().unwrap();
    sink.location(LocationFix::at(60.1699, 24.9384, OffsetDateTime::now_utc()))
        .unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, TrackerEvent::SyncFailed { .. } | TrackerEvent::SyncCompleted { .. })
    })
    .await;
    assert!(matches!(
        failed,
        TrackerEvent::SyncFailed {
            kind: BatchKind::Locations,
            ..
        }
    ));

    // Far enough to pass the low-power distance gate
    sink.location(LocationFix::at(60.1899, 24.9384, OffsetDateTime::now_utc()))
        .unwrap();
    tracker.sync_now().unwrap();

    let synced = wait_for(&mut events, |e| matches!(e, TrackerEvent::SyncCompleted { .. })).await;
    assert_eq!(
        synced,
        TrackerEvent::SyncCompleted {
            kind: BatchKind::Locations,
            count: 2,
        }
    );
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_without_permission_waits_for_grant() {
    let builder = builder(AuthorizationStatus::NotDetermined);
    let sink = builder.sink();
    let (tracker, mut events) = builder.spawn().unwrap();

    tracker.start_tracking().unwrap();
    sink.authorization(AuthorizationStatus::AllowedWhenInUse).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TrackerEvent::AuthorizationChanged(AuthorizationStatus::AllowedWhenInUse)
    );
    wait_for(&mut events, |e| *e == TrackerEvent::TrackingStarted).await;

    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_mode_keeps_samples_queued() {
    let dir = tempfile::tempdir().unwrap();
    let builder = builder(AuthorizationStatus::AllowedAlways)
        .store(JsonFileStore::new(dir.path()).unwrap());
    let sink = builder.sink();
    let (tracker, mut events) = builder.spawn().unwrap();

    tracker.start_tracking().unwrap();
    sink.location(LocationFix::at(60.0, 25.0, OffsetDateTime::now_utc()))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, TrackerEvent::PositionChanged { .. })).await;
    tracker.sync_now().unwrap();
    tracker.shutdown().await.unwrap();

    while let Some(event) = events.recv().await {
        assert!(!matches!(
            event,
            TrackerEvent::SyncCompleted { .. } | TrackerEvent::SyncFailed { .. }
        ));
    }

    let store = JsonFileStore::new(dir.path()).unwrap();
    assert_eq!(store.retrieve(BatchKind::Locations).unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_collaborator_is_reported() {
    let result = Tracker::builder(TrackerConfig::default())
        .location_provider(StubLocation {
            status: AuthorizationStatus::AllowedAlways,
        })
        .motion_provider(StubMotion)
        .resolver(StaticResolver::new(vec![UUID.to_string()]))
        .spawn();

    assert!(matches!(
        result,
        Err(TrackerError::MissingCollaborator("beacon provider"))
    ));
}

#[test]
fn test_spawn_requires_runtime() {
    let result = builder(AuthorizationStatus::AllowedAlways).spawn();
    assert!(matches!(result, Err(TrackerError::NoRuntime)));
}

#[tokio::test]
async fn test_sink_fails_after_shutdown() {
    let builder = builder(AuthorizationStatus::AllowedAlways);
    let sink = builder.sink();
    let (tracker, mut events) = builder.spawn().unwrap();

    tracker.start_tracking().unwrap();
    tracker.shutdown().await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    assert_eq!(seen.last(), Some(&TrackerEvent::TrackingStopped));

    assert!(matches!(
        sink.location(LocationFix::at(60.0, 25.0, OffsetDateTime::now_utc())),
        Err(TrackerError::NotRunning)
    ));
}
