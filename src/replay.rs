//! Recorded sensor sessions played back into a tracker.
//!
//! A replay file holds one JSON record per line. Every record carries the
//! wall-clock time `at` it was captured plus a `type` tag:
//!
//! ```text
//! {"at":"2024-03-01T12:00:00Z","type":"authorization","status":"allowed_always"}
//! {"at":"2024-03-01T12:00:01Z","type":"location","latitude":48.2,"longitude":16.37,...}
//! {"at":"2024-03-01T12:00:02Z","type":"sightings","sightings":[{"uuid":"...","major":1,...}]}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, RwLock};
use time::OffsetDateTime;
use tokio::time::sleep;

use crate::error::{ReplayError, TrackerError};
use crate::models::{
    AccelerationSample, AcquisitionSettings, AuthorizationStatus, BatteryStatus, BeaconSighting,
    ChargingState, HostState, LocationFix,
};
use crate::providers::{BeaconProvider, LocationProvider, MotionProvider};
use crate::runtime::SensorSink;
use crate::utils::{elapsed, to_std_duration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Location(LocationFix),
    Authorization { status: AuthorizationStatus },
    Sightings { sightings: Vec<BeaconSighting> },
    Acceleration(AccelerationSample),
    Battery { state: ChargingState, level: f32 },
    AppState { state: HostState },
    ServerPosition(LocationFix),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(flatten)]
    pub event: ReplayEvent,
}

/// A loaded session plus the authorization state its providers report.
pub struct Replay {
    records: Vec<ReplayRecord>,
    authorization: Arc<RwLock<AuthorizationStatus>>,
}

impl Replay {
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let file = File::open(path)?;
        let replay = Self::from_reader(BufReader::new(file))?;
        info!(
            "Loaded {} replay record(s) from {}",
            replay.len(),
            path.display()
        );
        Ok(replay)
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, ReplayError> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record: ReplayRecord =
                serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
                    line: index + 1,
                    source,
                })?;
            records.push(record);
        }
        records.sort_by_key(|r| r.at);

        Ok(Replay {
            records,
            authorization: Arc::new(RwLock::new(AuthorizationStatus::AllowedAlways)),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }

    /// Location provider whose authorization follows the replayed records.
    pub fn location_provider(&self) -> ReplayLocationProvider {
        ReplayLocationProvider {
            authorization: self.authorization.clone(),
        }
    }

    /// Push every record into `sink`, keeping the recorded gaps divided by `speed`.
    ///
    /// A `speed` of zero or less replays without pauses. Returns the number of
    /// records delivered.
    pub async fn run(self, sink: SensorSink, speed: f64) -> Result<usize, TrackerError> {
        let mut previous: Option<OffsetDateTime> = None;
        let mut delivered = 0;

        for record in self.records {
            if let Some(prev) = previous {
                let gap = to_std_duration(elapsed(prev, record.at));
                if speed > 0.0 && !gap.is_zero() {
                    sleep(gap.div_f64(speed)).await;
                }
            }
            previous = Some(record.at);

            debug!("Replaying {:?}", record.event);
            match record.event {
                ReplayEvent::Location(fix) => sink.location(fix)?,
                ReplayEvent::Authorization { status } => {
                    match self.authorization.write() {
                        Ok(mut current) => *current = status,
                        Err(poisoned) => *poisoned.into_inner() = status,
                    }
                    sink.authorization(status)?
                }
                ReplayEvent::Sightings { sightings } => sink.sightings(sightings)?,
                ReplayEvent::Acceleration(sample) => sink.acceleration(sample)?,
                ReplayEvent::Battery { state, level } => {
                    sink.battery(BatteryStatus::new(state, level))?
                }
                ReplayEvent::AppState { state } => sink.app_state(state)?,
                ReplayEvent::ServerPosition(fix) => sink.server_position(fix)?,
            }
            delivered += 1;
        }

        info!("Replay finished after {} record(s)", delivered);
        Ok(delivered)
    }
}

/// Location provider backed by a replay. Acquisition commands are only logged.
pub struct ReplayLocationProvider {
    authorization: Arc<RwLock<AuthorizationStatus>>,
}

impl LocationProvider for ReplayLocationProvider {
    fn authorization(&self) -> AuthorizationStatus {
        match self.authorization.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn request_authorization(&mut self) {
        info!("[replay] authorization requested");
    }

    fn start_precise(&mut self) {
        info!("[replay] precise GPS on");
    }

    fn stop_precise(&mut self) {
        info!("[replay] precise GPS off");
    }

    fn start_low_power(&mut self) {
        info!("[replay] low-power GPS on");
    }

    fn stop_low_power(&mut self) {
        info!("[replay] low-power GPS off");
    }

    fn configure(&mut self, settings: AcquisitionSettings) {
        info!(
            "[replay] accuracy {:?} (~{} m), distance filter {} m",
            settings.accuracy,
            settings.accuracy.meters(),
            settings.distance_filter_m
        );
    }
}

#[derive(Debug, Default)]
pub struct ReplayBeaconProvider;

impl BeaconProvider for ReplayBeaconProvider {
    fn start_monitoring(&mut self, uuids: &[String]) {
        info!("[replay] ranging {}", uuids.join(", "));
    }

    fn stop_monitoring(&mut self) {
        info!("[replay] ranging off");
    }
}

#[derive(Debug, Default)]
pub struct ReplayMotionProvider;

impl MotionProvider for ReplayMotionProvider {
    fn start_sampling(&mut self, interval: std::time::Duration) {
        info!("[replay] motion sampling every {:?}", interval);
    }

    fn stop_sampling(&mut self) {
        info!("[replay] motion sampling off");
    }
}
