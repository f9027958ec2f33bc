/// GPS acquisition control and significance gating
use log::{debug, info};

use crate::config::{AccuracyPair, ChannelFilter, GpsConfig};
use crate::models::{
    AcquisitionSettings, AuthorizationStatus, BatteryStatus, ChargingState, GpsMode, LocationFix,
};
use crate::providers::LocationProvider;
use crate::utils::elapsed;

/// Drives the precise and low-power channels of a location provider.
///
/// Both channels can run independently; the orchestrator decides which
/// combination is active. Fixes are accepted only when they differ enough
/// from the last accepted one, by distance or by age.
pub struct GpsController {
    config: GpsConfig,
    provider: Box<dyn LocationProvider>,
    precise: bool,
    low_power: bool,
    battery: BatteryStatus,
    applied: Option<AcquisitionSettings>,
    last_fix: Option<LocationFix>,
}

impl GpsController {
    pub fn new(config: GpsConfig, provider: Box<dyn LocationProvider>) -> Self {
        Self {
            config,
            provider,
            precise: false,
            low_power: false,
            battery: BatteryStatus::default(),
            applied: None,
            last_fix: None,
        }
    }

    pub fn authorization(&self) -> AuthorizationStatus {
        self.provider.authorization()
    }

    pub fn request_authorization(&mut self) {
        info!("Requesting location authorization");
        self.provider.request_authorization();
    }

    pub fn mode(&self) -> GpsMode {
        if self.precise {
            GpsMode::Precise
        } else if self.low_power {
            GpsMode::LowPower
        } else {
            GpsMode::Off
        }
    }

    pub fn is_precise(&self) -> bool {
        self.precise
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.last_fix.as_ref()
    }

    pub fn start_precise(&mut self) {
        if self.precise || !self.authorized() {
            return;
        }
        self.provider.start_precise();
        self.precise = true;
        info!("Precise GPS started");
        self.update_accuracy();
    }

    pub fn stop_precise(&mut self) {
        if !self.precise {
            return;
        }
        self.provider.stop_precise();
        self.precise = false;
        info!("Precise GPS stopped");
        self.update_accuracy();
    }

    pub fn start_low_power(&mut self) {
        if self.low_power || !self.authorized() {
            return;
        }
        self.provider.start_low_power();
        self.low_power = true;
        info!("Low-power GPS started");
        self.update_accuracy();
    }

    pub fn stop_low_power(&mut self) {
        if !self.low_power {
            return;
        }
        self.provider.stop_low_power();
        self.low_power = false;
        info!("Low-power GPS stopped");
        self.update_accuracy();
    }

    /// Stop both channels.
    pub fn stop_all(&mut self) {
        self.stop_precise();
        self.stop_low_power();
    }

    pub fn on_battery(&mut self, status: BatteryStatus) {
        self.battery = status;
        self.update_accuracy();
    }

    /// Gate a raw fix. Returns it when it should be reported.
    pub fn on_raw_fix(&mut self, fix: LocationFix) -> Option<LocationFix> {
        let filter = self.active_filter()?;

        if let Some(last) = &self.last_fix {
            let distance = fix.distance_to(last);
            let age = elapsed(last.timestamp, fix.timestamp);
            if distance <= filter.distance_m && age <= filter.time {
                debug!(
                    "Dropping fix {:.1} m / {:.1} s from last accepted",
                    distance,
                    age.as_seconds_f64()
                );
                return None;
            }
        }

        self.last_fix = Some(fix.clone());
        Some(fix)
    }

    /// Accuracy pair for the current battery situation.
    pub fn accuracy_pair(&self) -> AccuracyPair {
        if !self.config.adjust_from_battery {
            return self.config.on_battery;
        }
        match self.battery.state {
            ChargingState::Charging | ChargingState::Full => self.config.charging,
            ChargingState::Unplugged | ChargingState::Unknown => match self.battery.level {
                Some(level) if level < self.config.low_battery_threshold => {
                    self.config.low_battery
                }
                _ => self.config.on_battery,
            },
        }
    }

    fn authorized(&self) -> bool {
        let status = self.provider.authorization();
        if !status.is_granted() {
            debug!("Location not authorized ({:?}), GPS stays off", status);
        }
        status.is_granted()
    }

    fn active_filter(&self) -> Option<ChannelFilter> {
        match self.mode() {
            GpsMode::Precise => Some(self.config.precise),
            GpsMode::LowPower => Some(self.config.low_power),
            GpsMode::Off => None,
        }
    }

    fn update_accuracy(&mut self) {
        let pair = self.accuracy_pair();
        let settings = match self.mode() {
            GpsMode::Precise => AcquisitionSettings {
                accuracy: pair.active,
                distance_filter_m: self.config.precise.distance_m,
            },
            GpsMode::LowPower => AcquisitionSettings {
                accuracy: pair.background,
                distance_filter_m: self.config.low_power.distance_m,
            },
            GpsMode::Off => {
                self.applied = None;
                return;
            }
        };

        if self.applied != Some(settings) {
            debug!(
                "GPS accuracy {:?}, distance filter {} m",
                settings.accuracy, settings.distance_filter_m
            );
            self.provider.configure(settings);
            self.applied = Some(settings);
        }
    }
}
