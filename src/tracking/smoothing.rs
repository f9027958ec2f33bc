/// RSSI smoothing strategies
///
/// A smoother turns every raw strength reading captured for one beacon during
/// a window into a single representative value. Readings that are not finite
/// or not strictly negative carry no information and are ignored.

/// Strategy used by the beacon aggregator to collapse a window of readings.
pub trait SignalSmoother: Send + Sync {
    /// Returns `None` when no valid reading remains after filtering.
    fn smooth(&self, readings: &[f64]) -> Option<f64>;
}

/// Arithmetic mean of the valid readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSmoother;

impl SignalSmoother for MeanSmoother {
    fn smooth(&self, readings: &[f64]) -> Option<f64> {
        let valid = valid_readings(readings);
        if valid.is_empty() {
            return None;
        }

        let count = valid.len() as f64;
        let mean = valid.iter().sum::<f64>() / count;

        // Summation error must not push the mean outside the observed range
        let (min, max) = bounds(&valid);
        Some(mean.clamp(min, max))
    }
}

/// Median of the valid readings; resistant to single outliers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianSmoother;

impl SignalSmoother for MedianSmoother {
    fn smooth(&self, readings: &[f64]) -> Option<f64> {
        let mut valid = valid_readings(readings);
        if valid.is_empty() {
            return None;
        }

        valid.sort_by(f64::total_cmp);
        let mid = valid.len() / 2;
        if valid.len() % 2 == 0 {
            Some(valid[mid - 1] + (valid[mid] - valid[mid - 1]) / 2.0)
        } else {
            Some(valid[mid])
        }
    }
}

/// Smooth with the default strategy.
pub fn smooth_rssi(readings: &[f64]) -> Option<f64> {
    MeanSmoother.smooth(readings)
}

fn valid_readings(readings: &[f64]) -> Vec<f64> {
    readings
        .iter()
        .copied()
        .filter(|r| r.is_finite() && *r < 0.0)
        .collect()
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        })
}
