/// Beacon sighting aggregation
///
/// Sightings are grouped per beacon identity during a window whose length
/// depends on the motion state. Closing a window smooths every group into one
/// [`BeaconFix`] and resets the buffer.
use log::{debug, info, warn};
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

use crate::config::BeaconConfig;
use crate::models::{BeaconFix, BeaconKey, BeaconSighting, MotionState, Proximity};
use crate::providers::BeaconProvider;
use crate::tracking::smoothing::{MeanSmoother, SignalSmoother};
use crate::utils::elapsed;

pub struct BeaconAggregator {
    config: BeaconConfig,
    provider: Box<dyn BeaconProvider>,
    smoother: Box<dyn SignalSmoother>,
    monitoring: bool,
    monitored: Vec<String>,
    captured: BTreeMap<BeaconKey, Vec<BeaconSighting>>,
    window_start: Option<OffsetDateTime>,
}

impl BeaconAggregator {
    pub fn new(config: BeaconConfig, provider: Box<dyn BeaconProvider>) -> Self {
        Self::with_smoother(config, provider, Box::new(MeanSmoother))
    }

    pub fn with_smoother(
        config: BeaconConfig,
        provider: Box<dyn BeaconProvider>,
        smoother: Box<dyn SignalSmoother>,
    ) -> Self {
        Self {
            config,
            provider,
            smoother,
            monitoring: false,
            monitored: Vec::new(),
            captured: BTreeMap::new(),
            window_start: None,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn monitored_uuids(&self) -> &[String] {
        &self.monitored
    }

    /// Number of sightings buffered in the current window.
    pub fn pending_sightings(&self) -> usize {
        self.captured.values().map(Vec::len).sum()
    }

    /// Start ranging `uuids`, replacing any set being monitored.
    ///
    /// Duplicates are dropped. An empty set leaves monitoring disabled.
    pub fn start_monitoring(&mut self, uuids: &[String]) {
        if self.monitoring {
            self.stop_monitoring();
        }

        let mut unique: Vec<String> = Vec::new();
        for uuid in uuids {
            let uuid = uuid.trim().to_lowercase();
            if !uuid.is_empty() && !unique.contains(&uuid) {
                unique.push(uuid);
            }
        }

        if unique.is_empty() {
            debug!("No beacon UUIDs to monitor");
            return;
        }
        if !self.provider.is_available() {
            warn!("Beacon ranging unavailable, skipping monitoring");
            return;
        }

        self.provider.start_monitoring(&unique);
        info!("Beacon monitoring started for {} UUID(s)", unique.len());
        self.monitored = unique;
        self.monitoring = true;
    }

    /// Stop ranging. No-op when not monitoring.
    pub fn stop_monitoring(&mut self) {
        if !self.monitoring {
            return;
        }
        self.provider.stop_monitoring();
        self.monitored.clear();
        self.monitoring = false;
        info!("Beacon monitoring stopped");
    }

    /// Stop ranging and discard the open window.
    pub fn reset(&mut self) {
        self.stop_monitoring();
        self.captured.clear();
        self.window_start = None;
    }

    /// Buffer a delivery of sightings.
    ///
    /// Returns the closed window's fixes when the buffer duration for `motion`
    /// has been exceeded.
    pub fn on_sightings(
        &mut self,
        sightings: Vec<BeaconSighting>,
        motion: MotionState,
    ) -> Option<Vec<BeaconFix>> {
        if !self.monitoring {
            return None;
        }

        let buffer = self.buffer_duration(motion);
        let mut closed: Option<Vec<BeaconFix>> = None;

        for sighting in sightings {
            if !sighting.rssi.is_known() {
                continue;
            }
            if !self.monitored.contains(&sighting.key.uuid) {
                debug!("Ignoring sighting of unmonitored beacon {}", sighting.key);
                continue;
            }

            let timestamp = sighting.timestamp;
            self.captured
                .entry(sighting.key.clone())
                .or_default()
                .push(sighting);

            match self.window_start {
                None => self.window_start = Some(timestamp),
                Some(start) if elapsed(start, timestamp) > buffer => {
                    let mut fixes = self.flush();
                    // Several windows can close within one delivery
                    closed.get_or_insert_with(Vec::new).append(&mut fixes);
                }
                Some(_) => {}
            }
        }

        closed
    }

    /// Close the current window now, returning one fix per beacon.
    pub fn flush(&mut self) -> Vec<BeaconFix> {
        let captured = std::mem::take(&mut self.captured);
        self.window_start = None;

        let fixes: Vec<BeaconFix> = captured
            .into_iter()
            .filter_map(|(key, sightings)| self.smooth_group(key, &sightings))
            .collect();

        debug!("Beacon window closed with {} fix(es)", fixes.len());
        fixes
    }

    fn buffer_duration(&self, motion: MotionState) -> Duration {
        match motion {
            MotionState::Moving => self.config.moving_buffer,
            MotionState::Standing => self.config.standing_buffer,
        }
    }

    fn smooth_group(&self, key: BeaconKey, sightings: &[BeaconSighting]) -> Option<BeaconFix> {
        let readings: Vec<f64> = sightings.iter().filter_map(|s| s.rssi.value()).collect();
        let rssi = self.smoother.smooth(&readings)?;
        let last = sightings.iter().max_by_key(|s| s.timestamp)?;
        let proximity = sightings
            .iter()
            .rev()
            .map(|s| s.proximity)
            .find(Proximity::is_known)
            .unwrap_or(Proximity::Unknown);

        Some(BeaconFix {
            key,
            rssi,
            proximity,
            samples: readings.len(),
            timestamp: last.timestamp,
        })
    }
}
