//! Interfaces of the host collaborators.
//!
//! Providers receive commands from the tracker. They never call back into it
//! directly; everything they observe goes through a [`SensorSink`], which can
//! be used from any thread.
//!
//! [`SensorSink`]: crate::runtime::SensorSink

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::{ResolveError, TransportError};
use crate::models::{AcquisitionSettings, AuthorizationStatus, LocationFix, SyncBatch};
use crate::runtime::SensorSink;

/// Platform location service with a precise and a significant-change channel.
pub trait LocationProvider: Send {
    fn authorization(&self) -> AuthorizationStatus;

    /// Ask the user for permission. The answer arrives as an authorization input.
    fn request_authorization(&mut self);

    fn start_precise(&mut self);

    fn stop_precise(&mut self);

    fn start_low_power(&mut self);

    fn stop_low_power(&mut self);

    /// Apply desired accuracy and distance filter.
    fn configure(&mut self, settings: AcquisitionSettings);
}

/// Beacon ranging service.
pub trait BeaconProvider: Send {
    fn is_available(&self) -> bool {
        true
    }

    fn start_monitoring(&mut self, uuids: &[String]);

    fn stop_monitoring(&mut self);
}

/// Accelerometer sampling service.
pub trait MotionProvider: Send {
    fn is_available(&self) -> bool {
        true
    }

    fn start_sampling(&mut self, interval: Duration);

    fn stop_sampling(&mut self);
}

/// Looks up the beacon UUIDs worth ranging around a position.
#[async_trait]
pub trait BeaconUuidResolver: Send + Sync {
    async fn beacon_uuids(&self, position: &LocationFix) -> Result<Vec<String>, ResolveError>;
}

/// Delivers queued batches to the remote service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &SyncBatch) -> Result<(), TransportError>;
}

/// Resolver returning the same UUID list for every position.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    uuids: Vec<String>,
}

impl StaticResolver {
    pub fn new(uuids: Vec<String>) -> Self {
        StaticResolver { uuids }
    }
}

#[async_trait]
impl BeaconUuidResolver for StaticResolver {
    async fn beacon_uuids(&self, _position: &LocationFix) -> Result<Vec<String>, ResolveError> {
        if self.uuids.is_empty() {
            return Err(ResolveError::NoBeacons);
        }
        Ok(self.uuids.clone())
    }
}

/// Location provider for a host that does not move.
///
/// Reports one fix at the configured position whenever a channel is started.
pub struct FixedLocationProvider {
    sink: SensorSink,
    latitude: f64,
    longitude: f64,
}

impl FixedLocationProvider {
    pub fn new(sink: SensorSink, latitude: f64, longitude: f64) -> Self {
        FixedLocationProvider {
            sink,
            latitude,
            longitude,
        }
    }

    fn report(&self) {
        let fix = LocationFix::at(self.latitude, self.longitude, OffsetDateTime::now_utc());
        if self.sink.location(fix).is_err() {
            warn!("Tracker gone, fixed position not reported");
        }
    }
}

impl LocationProvider for FixedLocationProvider {
    fn authorization(&self) -> AuthorizationStatus {
        AuthorizationStatus::AllowedAlways
    }

    fn request_authorization(&mut self) {}

    fn start_precise(&mut self) {
        self.report();
    }

    fn stop_precise(&mut self) {}

    fn start_low_power(&mut self) {
        self.report();
    }

    fn stop_low_power(&mut self) {}

    fn configure(&mut self, settings: AcquisitionSettings) {
        debug!("Fixed position ignores {:?}", settings);
    }
}

/// Recording providers for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        RequestAuthorization,
        StartPrecise,
        StopPrecise,
        StartLowPower,
        StopLowPower,
        Configure(AcquisitionSettings),
        StartMonitoring(Vec<String>),
        StopMonitoring,
        StartSampling,
        StopSampling,
    }

    pub type CallLog = Arc<Mutex<Vec<Call>>>;

    pub fn calls(log: &CallLog) -> Vec<Call> {
        log.lock().unwrap().clone()
    }

    pub fn clear(log: &CallLog) {
        log.lock().unwrap().clear();
    }

    pub struct FakeLocation {
        pub status: Arc<Mutex<AuthorizationStatus>>,
        pub log: CallLog,
    }

    impl FakeLocation {
        pub fn granted() -> (Self, CallLog) {
            Self::with_status(AuthorizationStatus::AllowedAlways)
        }

        pub fn with_status(status: AuthorizationStatus) -> (Self, CallLog) {
            let log = CallLog::default();
            let provider = FakeLocation {
                status: Arc::new(Mutex::new(status)),
                log: log.clone(),
            };
            (provider, log)
        }
    }

    impl LocationProvider for FakeLocation {
        fn authorization(&self) -> AuthorizationStatus {
            *self.status.lock().unwrap()
        }

        fn request_authorization(&mut self) {
            self.log.lock().unwrap().push(Call::RequestAuthorization);
        }

        fn start_precise(&mut self) {
            self.log.lock().unwrap().push(Call::StartPrecise);
        }

        fn stop_precise(&mut self) {
            self.log.lock().unwrap().push(Call::StopPrecise);
        }

        fn start_low_power(&mut self) {
            self.log.lock().unwrap().push(Call::StartLowPower);
        }

        fn stop_low_power(&mut self) {
            self.log.lock().unwrap().push(Call::StopLowPower);
        }

        fn configure(&mut self, settings: AcquisitionSettings) {
            self.log.lock().unwrap().push(Call::Configure(settings));
        }
    }

    pub struct FakeBeacons {
        pub available: bool,
        pub log: CallLog,
    }

    impl FakeBeacons {
        pub fn new() -> (Self, CallLog) {
            let log = CallLog::default();
            (
                FakeBeacons {
                    available: true,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl BeaconProvider for FakeBeacons {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start_monitoring(&mut self, uuids: &[String]) {
            self.log
                .lock()
                .unwrap()
                .push(Call::StartMonitoring(uuids.to_vec()));
        }

        fn stop_monitoring(&mut self) {
            self.log.lock().unwrap().push(Call::StopMonitoring);
        }
    }

    pub struct FakeMotion {
        pub available: bool,
        pub log: CallLog,
    }

    impl FakeMotion {
        pub fn new() -> (Self, CallLog) {
            let log = CallLog::default();
            (
                FakeMotion {
                    available: true,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl MotionProvider for FakeMotion {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start_sampling(&mut self, _interval: Duration) {
            self.log.lock().unwrap().push(Call::StartSampling);
        }

        fn stop_sampling(&mut self) {
            self.log.lock().unwrap().push(Call::StopSampling);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_static_resolver() {
        let fix = LocationFix::at(48.2, 16.37, datetime!(2024-03-01 12:00 UTC));

        let resolver = StaticResolver::new(vec!["abc".to_string()]);
        assert_eq!(resolver.beacon_uuids(&fix).await.unwrap(), vec!["abc"]);

        let empty = StaticResolver::default();
        assert!(matches!(
            empty.beacon_uuids(&fix).await,
            Err(ResolveError::NoBeacons)
        ));
    }
}
