/// Utility functions for geodesy, time arithmetic and log formatting
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

/// Mean Earth radius used by the haversine formula, in metres
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!(
        "[day].[month].[year] - [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| dt.to_string())
}

/// Great-circle distance between two WGS84 coordinates in metres
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Time elapsed from `earlier` to `later`; negative when the clock went backwards
pub fn elapsed(earlier: OffsetDateTime, later: OffsetDateTime) -> Duration {
    later - earlier
}

/// Convert a time::Duration to a std::time::Duration, clamping negatives to zero
///
/// Helper for handing configured intervals to tokio timers.
pub fn to_std_duration(duration: Duration) -> std::time::Duration {
    std::time::Duration::try_from(duration).unwrap_or_default()
}
