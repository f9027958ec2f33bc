use log::{debug, info};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use time::Duration;

use crate::error::ConfigError;
use crate::models::DesiredAccuracy;

/// Hysteresis settings for the moving/standing classifier.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Per-axis user acceleration (g) above which a sample counts as active
    pub activity_threshold: f64,
    /// Continuous activity needed before standing turns into moving
    pub moving_delay: Duration,
    /// Continuous stillness needed before moving turns into standing
    pub standing_delay: Duration,
    /// Sampling cadence requested from the motion provider
    pub sample_interval: std::time::Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            activity_threshold: 0.1,
            moving_delay: Duration::seconds(2),
            standing_delay: Duration::seconds(10),
            sample_interval: std::time::Duration::from_millis(200),
        }
    }
}

/// Aggregation windows for beacon sightings.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub moving_buffer: Duration,
    pub standing_buffer: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            moving_buffer: Duration::seconds(3),
            standing_buffer: Duration::seconds(10),
        }
    }
}

/// Significance gate of one GPS channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFilter {
    pub distance_m: f64,
    pub time: Duration,
}

/// Desired accuracy for the precise (active) and low-power (background) channels.
#[derive(Debug, Clone, Copy)]
pub struct AccuracyPair {
    pub active: DesiredAccuracy,
    pub background: DesiredAccuracy,
}

#[derive(Debug, Clone)]
pub struct GpsConfig {
    pub precise: ChannelFilter,
    pub low_power: ChannelFilter,
    /// When false the accuracy table is ignored and `on_battery` is always used
    pub adjust_from_battery: bool,
    /// Charge level (0..1) under which the reduced accuracy pair applies
    pub low_battery_threshold: f32,
    pub charging: AccuracyPair,
    pub on_battery: AccuracyPair,
    pub low_battery: AccuracyPair,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            precise: ChannelFilter {
                distance_m: 5.0,
                time: Duration::seconds(5),
            },
            low_power: ChannelFilter {
                distance_m: 500.0,
                time: Duration::minutes(5),
            },
            adjust_from_battery: true,
            low_battery_threshold: 0.2,
            charging: AccuracyPair {
                active: DesiredAccuracy::BestForNavigation,
                background: DesiredAccuracy::HundredMeters,
            },
            on_battery: AccuracyPair {
                active: DesiredAccuracy::TenMeters,
                background: DesiredAccuracy::Kilometer,
            },
            low_battery: AccuracyPair {
                active: DesiredAccuracy::HundredMeters,
                background: DesiredAccuracy::ThreeKilometers,
            },
        }
    }
}

/// Decision parameters of the orchestrator.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Fixes with a known proximity needed to count as beacon-proximate
    pub min_known_for_proximate: usize,
    /// Whether a single immediate beacon is enough on its own
    pub immediate_is_proximate: bool,
    /// Start low-power GPS while backgrounded if precise GPS is off
    pub reduce_when_backgrounded: bool,
    /// Surface only server-pushed positions; device fixes are still synced
    pub prefer_server_positions: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_known_for_proximate: 3,
            immediate_is_proximate: true,
            reduce_when_backgrounded: false,
            prefer_server_positions: false,
        }
    }
}

/// Flush when the last send is older than `max_age` or the queue holds more than `max_entries`.
#[derive(Debug, Clone, Copy)]
pub struct FlushThreshold {
    pub max_age: Duration,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    pub beacons: FlushThreshold,
    pub locations: FlushThreshold,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub foreground: SyncPolicy,
    pub background: SyncPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            foreground: SyncPolicy {
                beacons: FlushThreshold {
                    max_age: Duration::minutes(1),
                    max_entries: 50,
                },
                locations: FlushThreshold {
                    max_age: Duration::minutes(1),
                    max_entries: 20,
                },
            },
            background: SyncPolicy {
                beacons: FlushThreshold {
                    max_age: Duration::minutes(10),
                    max_entries: 500,
                },
                locations: FlushThreshold {
                    max_age: Duration::minutes(10),
                    max_entries: 200,
                },
            },
        }
    }
}

/// All tunable policy of the tracker.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub motion: MotionConfig,
    pub beacons: BeaconConfig,
    pub gps: GpsConfig,
    pub fusion: FusionConfig,
    pub sync: SyncConfig,
}

/// Settings of the `fusion-tracker` service binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub tracker: TrackerConfig,
    /// Remote sink; `None` runs in local mode without a transport
    pub database_url: Option<String>,
    pub beacon_uuids: Vec<String>,
    pub cache_dir: PathBuf,
    pub replay_file: Option<PathBuf>,
    /// Divisor applied to recorded gaps; 0 replays without pauses
    pub replay_speed: f64,
    /// Static "lat,lon" reported when no replay file drives the location channel
    pub fixed_position: Option<(f64, f64)>,
    pub device_id: String,
    pub user_id: String,
}

impl ServiceConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source. `new()` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let beacon_uuids = match lookup("BEACON_UUIDS") {
            Some(raw) => parse_uuid_list(&raw)?,
            None => {
                debug!("BEACON_UUIDS not set, beacon monitoring needs a resolver");
                Vec::new()
            }
        };

        let mut tracker = TrackerConfig::default();
        tracker.motion.activity_threshold = parse_or(
            &lookup,
            "FUSION_ACTIVITY_THRESHOLD",
            tracker.motion.activity_threshold,
        )?;
        tracker.motion.moving_delay =
            seconds_or(&lookup, "FUSION_MOVING_DELAY_SECS", tracker.motion.moving_delay)?;
        tracker.motion.standing_delay = seconds_or(
            &lookup,
            "FUSION_STANDING_DELAY_SECS",
            tracker.motion.standing_delay,
        )?;
        tracker.beacons.moving_buffer = seconds_or(
            &lookup,
            "FUSION_MOVING_BUFFER_SECS",
            tracker.beacons.moving_buffer,
        )?;
        tracker.beacons.standing_buffer = seconds_or(
            &lookup,
            "FUSION_STANDING_BUFFER_SECS",
            tracker.beacons.standing_buffer,
        )?;
        tracker.gps.low_battery_threshold = parse_or(
            &lookup,
            "FUSION_LOW_BATTERY_THRESHOLD",
            tracker.gps.low_battery_threshold,
        )?;
        tracker.gps.adjust_from_battery = parse_or(
            &lookup,
            "FUSION_ADJUST_FROM_BATTERY",
            tracker.gps.adjust_from_battery,
        )?;
        tracker.fusion.min_known_for_proximate = parse_or(
            &lookup,
            "FUSION_MIN_KNOWN_BEACONS",
            tracker.fusion.min_known_for_proximate,
        )?;
        tracker.fusion.reduce_when_backgrounded = parse_or(
            &lookup,
            "FUSION_REDUCE_WHEN_BACKGROUNDED",
            tracker.fusion.reduce_when_backgrounded,
        )?;

        let fixed_position = match lookup("FIXED_POSITION") {
            Some(raw) => Some(parse_position(&raw).ok_or(ConfigError::InvalidValue {
                key: "FIXED_POSITION".to_string(),
                value: raw,
            })?),
            None => None,
        };

        let config = ServiceConfig {
            tracker,
            database_url,
            beacon_uuids,
            cache_dir: lookup("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".fusion-cache")),
            replay_file: lookup("REPLAY_FILE").map(PathBuf::from),
            replay_speed: parse_or(&lookup, "REPLAY_SPEED", 1.0)?,
            fixed_position,
            device_id: lookup("DEVICE_ID").unwrap_or_else(|| "local-device".to_string()),
            user_id: lookup("USER_ID").unwrap_or_default(),
        };

        info!(
            "Loaded configuration: {} beacon UUID(s), {} mode",
            config.beacon_uuids.len(),
            if config.database_url.is_some() {
                "remote"
            } else {
                "local"
            }
        );

        Ok(config)
    }
}

/// Parse a comma separated UUID list, lowercasing and dropping duplicates.
pub fn parse_uuid_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut uuids: Vec<String> = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !is_valid_uuid(part) {
            return Err(ConfigError::InvalidUuid(part.to_string()));
        }
        let uuid = part.to_lowercase();
        if !uuids.contains(&uuid) {
            uuids.push(uuid);
        }
    }
    Ok(uuids)
}

/// Check the canonical 8-4-4-4-12 hex layout.
pub fn is_valid_uuid(candidate: &str) -> bool {
    let groups: Vec<&str> = candidate.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Parse `"lat,lon"` in decimal degrees.
pub fn parse_position(raw: &str) -> Option<(f64, f64)> {
    let (lat, lon) = raw.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn seconds_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let seconds: f64 = parse_or(lookup, key, default.as_seconds_f64())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: seconds.to_string(),
        });
    }
    Ok(Duration::seconds_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_uuid_list_dedups_and_lowercases() {
        let uuids = parse_uuid_list(
            "F7826DA6-4FA2-4E98-8024-BC5B71E0893E, f7826da6-4fa2-4e98-8024-bc5b71e0893e,,\
             B9407F30-F5F8-466E-AFF9-25556B57FE6D",
        )
        .unwrap();
        assert_eq!(
            uuids,
            vec![
                "f7826da6-4fa2-4e98-8024-bc5b71e0893e".to_string(),
                "b9407f30-f5f8-466e-aff9-25556b57fe6d".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_uuid_list_rejects_garbage() {
        assert!(matches!(
            parse_uuid_list("not-a-uuid"),
            Err(ConfigError::InvalidUuid(_))
        ));
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = ServiceConfig::from_lookup(|_| None).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.beacon_uuids.is_empty());
        assert_eq!(config.device_id, "local-device");
        assert_eq!(config.tracker.fusion.min_known_for_proximate, 3);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://u:p@db/fusion?sslrootcert=/ca.pem"),
            ("FUSION_MOVING_DELAY_SECS", "1.5"),
            ("FUSION_MIN_KNOWN_BEACONS", "2"),
            ("FUSION_ADJUST_FROM_BATTERY", "false"),
        ]))
        .unwrap();
        assert!(config.database_url.is_some());
        assert_eq!(config.tracker.motion.moving_delay, Duration::milliseconds(1500));
        assert_eq!(config.tracker.fusion.min_known_for_proximate, 2);
        assert!(!config.tracker.gps.adjust_from_battery);
    }

    #[test]
    fn test_fixed_position() {
        assert_eq!(parse_position("48.2082, 16.3738"), Some((48.2082, 16.3738)));
        assert_eq!(parse_position("91.0,0.0"), None);
        assert_eq!(parse_position("48.2"), None);

        let err = ServiceConfig::from_lookup(lookup_from(&[("FIXED_POSITION", "here")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "FIXED_POSITION"));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("FUSION_STANDING_DELAY_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "FUSION_STANDING_DELAY_SECS"));

        let err = ServiceConfig::from_lookup(lookup_from(&[("FUSION_MOVING_BUFFER_SECS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
