use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::utils::haversine_distance;

/// Raw signal strength of a beacon advertisement in dB.
///
/// Platforms report `0` (or any non-negative value) when the strength could
/// not be measured. That sentinel is turned into `Unknown` as soon as a
/// reading enters the crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub enum SignalStrength {
    Known(f64),
    Unknown,
}

impl SignalStrength {
    pub fn value(&self) -> Option<f64> {
        match self {
            SignalStrength::Known(v) => Some(*v),
            SignalStrength::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, SignalStrength::Known(_))
    }
}

impl From<f64> for SignalStrength {
    fn from(raw: f64) -> Self {
        if raw.is_finite() && raw < 0.0 {
            SignalStrength::Known(raw)
        } else {
            SignalStrength::Unknown
        }
    }
}

impl From<SignalStrength> for f64 {
    fn from(strength: SignalStrength) -> Self {
        strength.value().unwrap_or(0.0)
    }
}

/// Coarse distance bucket of a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    #[default]
    Unknown,
}

impl Proximity {
    pub fn is_known(&self) -> bool {
        *self != Proximity::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Proximity::Immediate => "immediate",
            Proximity::Near => "near",
            Proximity::Far => "far",
            Proximity::Unknown => "unknown",
        }
    }

    /// Estimate the proximity class from RSSI and the calibrated TX power
    /// (expected RSSI at one metre), using a free-space path loss model.
    pub fn estimate(rssi: SignalStrength, tx_power: i8) -> Self {
        let Some(rssi) = rssi.value() else {
            return Proximity::Unknown;
        };
        if tx_power >= 0 {
            return Proximity::Unknown;
        }

        let distance = 10f64.powf((f64::from(tx_power) - rssi) / 20.0);
        if distance < 0.5 {
            Proximity::Immediate
        } else if distance < 3.0 {
            Proximity::Near
        } else {
            Proximity::Far
        }
    }
}

/// Identity of a physical beacon. UUIDs are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeaconKey {
    pub uuid: String,
    pub major: u16,
    pub minor: u16,
}

impl BeaconKey {
    pub fn new(uuid: &str, major: u16, minor: u16) -> Self {
        BeaconKey {
            uuid: uuid.trim().to_lowercase(),
            major,
            minor,
        }
    }
}

impl fmt::Display for BeaconKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.uuid, self.major, self.minor)
    }
}

/// One raw advertisement observed by the beacon provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconSighting {
    #[serde(flatten)]
    pub key: BeaconKey,
    pub rssi: SignalStrength,
    #[serde(default)]
    pub proximity: Proximity,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl BeaconSighting {
    pub fn new(
        uuid: &str,
        major: u16,
        minor: u16,
        rssi: f64,
        proximity: Proximity,
        timestamp: OffsetDateTime,
    ) -> Self {
        BeaconSighting {
            key: BeaconKey::new(uuid, major, minor),
            rssi: SignalStrength::from(rssi),
            proximity,
            timestamp,
        }
    }
}

/// Smoothed reading for one beacon over an aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconFix {
    #[serde(flatten)]
    pub key: BeaconKey,
    pub rssi: f64,
    pub proximity: Proximity,
    pub samples: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub heading: f64,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl LocationFix {
    /// Fix with only a position and time; remaining fields zeroed.
    pub fn at(latitude: f64, longitude: f64, timestamp: OffsetDateTime) -> Self {
        LocationFix {
            latitude,
            longitude,
            altitude: 0.0,
            heading: 0.0,
            horizontal_accuracy: 0.0,
            vertical_accuracy: 0.0,
            timestamp,
        }
    }

    /// Great-circle distance to another fix in metres.
    pub fn distance_to(&self, other: &LocationFix) -> f64 {
        haversine_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// User acceleration (gravity removed) in g.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AccelerationSample {
    /// True when the magnitude on any axis is above `threshold`.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.x.abs() > threshold || self.y.abs() > threshold || self.z.abs() > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    #[default]
    Standing,
    Moving,
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Standing => write!(f, "standing"),
            MotionState::Moving => write!(f, "moving"),
        }
    }
}

/// Which GPS channel is currently delivering fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsMode {
    #[default]
    Off,
    Precise,
    LowPower,
}

/// Accuracy buckets understood by location providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredAccuracy {
    BestForNavigation,
    Best,
    TenMeters,
    HundredMeters,
    Kilometer,
    ThreeKilometers,
}

impl DesiredAccuracy {
    pub fn meters(&self) -> f64 {
        match self {
            DesiredAccuracy::BestForNavigation => 0.0,
            DesiredAccuracy::Best => 1.0,
            DesiredAccuracy::TenMeters => 10.0,
            DesiredAccuracy::HundredMeters => 100.0,
            DesiredAccuracy::Kilometer => 1000.0,
            DesiredAccuracy::ThreeKilometers => 3000.0,
        }
    }
}

/// Settings pushed to the location provider whenever they change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub accuracy: DesiredAccuracy,
    pub distance_filter_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargingState {
    #[default]
    Unknown,
    Unplugged,
    Charging,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub state: ChargingState,
    /// Charge in `0.0..=1.0`; `None` when the platform cannot tell.
    pub level: Option<f32>,
}

impl BatteryStatus {
    /// Build from a platform reading where a negative level means unknown.
    pub fn new(state: ChargingState, raw_level: f32) -> Self {
        let level = (raw_level >= 0.0).then(|| raw_level.min(1.0));
        BatteryStatus { state, level }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    #[default]
    NotDetermined,
    Denied,
    AllowedWhenInUse,
    AllowedAlways,
    /// Location services are switched off device-wide.
    ServicesDisabled,
}

impl AuthorizationStatus {
    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::AllowedWhenInUse | AuthorizationStatus::AllowedAlways
        )
    }
}

/// Whether the host process is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Beacons,
    Locations,
}

impl BatchKind {
    pub const ALL: [BatchKind; 2] = [BatchKind::Beacons, BatchKind::Locations];
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Beacons => write!(f, "beacons"),
            BatchKind::Locations => write!(f, "locations"),
        }
    }
}

/// Ordered samples of one kind awaiting transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "samples", rename_all = "lowercase")]
pub enum SyncBatch {
    Beacons(Vec<BeaconFix>),
    Locations(Vec<LocationFix>),
}

impl SyncBatch {
    pub fn empty(kind: BatchKind) -> Self {
        match kind {
            BatchKind::Beacons => SyncBatch::Beacons(Vec::new()),
            BatchKind::Locations => SyncBatch::Locations(Vec::new()),
        }
    }

    pub fn kind(&self) -> BatchKind {
        match self {
            SyncBatch::Beacons(_) => BatchKind::Beacons,
            SyncBatch::Locations(_) => BatchKind::Locations,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SyncBatch::Beacons(fixes) => fixes.len(),
            SyncBatch::Locations(fixes) => fixes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the first `count` samples, keeping the order of the rest.
    pub fn skip_front(self, count: usize) -> Self {
        match self {
            SyncBatch::Beacons(fixes) => SyncBatch::Beacons(fixes.into_iter().skip(count).collect()),
            SyncBatch::Locations(fixes) => {
                SyncBatch::Locations(fixes.into_iter().skip(count).collect())
            }
        }
    }
}

/// Where a reported position came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    /// Accepted by the local GPS gate.
    Device,
    /// Pushed by the remote service over its standing connection.
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_signal_strength_sentinels() {
        assert_eq!(SignalStrength::from(-67.0), SignalStrength::Known(-67.0));
        assert_eq!(SignalStrength::from(0.0), SignalStrength::Unknown);
        assert_eq!(SignalStrength::from(3.0), SignalStrength::Unknown);
        assert_eq!(SignalStrength::from(f64::NAN), SignalStrength::Unknown);
        assert_eq!(f64::from(SignalStrength::Unknown), 0.0);
    }

    #[test]
    fn test_proximity_estimate() {
        assert_eq!(
            Proximity::estimate(SignalStrength::Known(-50.0), -59),
            Proximity::Immediate
        );
        assert_eq!(
            Proximity::estimate(SignalStrength::Known(-62.0), -59),
            Proximity::Near
        );
        assert_eq!(
            Proximity::estimate(SignalStrength::Known(-90.0), -59),
            Proximity::Far
        );
        assert_eq!(
            Proximity::estimate(SignalStrength::Unknown, -59),
            Proximity::Unknown
        );
    }

    #[test]
    fn test_beacon_key_normalized() {
        let key = BeaconKey::new(" F7826DA6-4FA2-4E98-8024-BC5B71E0893E ", 1, 2);
        assert_eq!(key.uuid, "f7826da6-4fa2-4e98-8024-bc5b71e0893e");
        assert_eq!(key.to_string(), "f7826da6-4fa2-4e98-8024-bc5b71e0893e_1_2");
    }

    #[test]
    fn test_sighting_json_shape() {
        let sighting = BeaconSighting::new(
            "ABC",
            1,
            2,
            -70.0,
            Proximity::Near,
            datetime!(2024-03-01 12:00 UTC),
        );
        let json = serde_json::to_value(&sighting).unwrap();
        assert_eq!(json["uuid"], "abc");
        assert_eq!(json["rssi"], -70.0);
        assert_eq!(json["proximity"], "near");
        assert_eq!(json["timestamp"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn test_battery_level_unknown() {
        assert_eq!(BatteryStatus::new(ChargingState::Unplugged, -1.0).level, None);
        assert_eq!(
            BatteryStatus::new(ChargingState::Unplugged, 0.4).level,
            Some(0.4)
        );
    }

    #[test]
    fn test_sync_batch_skip_front() {
        let ts = datetime!(2024-03-01 12:00 UTC);
        let batch = SyncBatch::Locations(vec![
            LocationFix::at(1.0, 1.0, ts),
            LocationFix::at(2.0, 2.0, ts),
            LocationFix::at(3.0, 3.0, ts),
        ]);
        let rest = batch.skip_front(2);
        assert_eq!(rest, SyncBatch::Locations(vec![LocationFix::at(3.0, 3.0, ts)]));
    }
}
