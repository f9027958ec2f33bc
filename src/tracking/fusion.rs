//! The orchestrator that ties the sub-trackers together.
//!
//! [`FusionCore`] is a plain state machine: every [`Input`] is handled to
//! completion and yields a list of [`Action`]s. It never awaits anything.
//! Resolver lookups and transmissions are requested as actions and their
//! results come back later as inputs, tagged so that stale completions can be
//! recognised. The runtime in [`crate::runtime`] owns one core per tracker
//! and executes its actions.

use log::{debug, error, info, warn};
use time::OffsetDateTime;

use crate::config::FusionConfig;
use crate::error::{ResolveError, TransportError};
use crate::models::{
    AccelerationSample, AuthorizationStatus, BatchKind, BatteryStatus, BeaconFix, BeaconSighting,
    GpsMode, HostState, LocationFix, MotionState, PositionSource, Proximity, SyncBatch,
};
use crate::sync::SyncBuffer;
use crate::tracking::beacons::BeaconAggregator;
use crate::tracking::gps::GpsController;
use crate::tracking::motion::MotionClassifier;

/// Commands issued by the owner of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartTracking,
    StopTracking,
    /// Flush every non-empty queue now, ignoring thresholds
    SyncNow,
}

/// Observations pushed by the host collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorInput {
    Authorization(AuthorizationStatus),
    Locations(Vec<LocationFix>),
    Sightings(Vec<BeaconSighting>),
    Acceleration(AccelerationSample),
    Battery(BatteryStatus),
    AppState(HostState),
    /// Position pushed by the remote service
    ServerPosition(LocationFix),
}

/// Everything the core reacts to.
#[derive(Debug, Clone)]
pub enum Input {
    Command(Command),
    Sensor(SensorInput),
    Resolved {
        session: u64,
        result: Result<Vec<String>, ResolveError>,
    },
    SyncFinished {
        kind: BatchKind,
        sent: usize,
        result: Result<(), TransportError>,
    },
}

/// Notifications delivered to the consumer of a tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    TrackingStarted,
    TrackingStopped,
    AuthorizationChanged(AuthorizationStatus),
    PositionChanged {
        fix: LocationFix,
        source: PositionSource,
    },
    MotionChanged(MotionState),
    BeaconsRanged(Vec<BeaconFix>),
    GpsModeChanged(GpsMode),
    SyncCompleted {
        kind: BatchKind,
        count: usize,
    },
    SyncFailed {
        kind: BatchKind,
        error: String,
    },
}

/// Work the core wants done outside of itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Notify(TrackerEvent),
    /// Look up beacon UUIDs around `fix`; answer with [`Input::Resolved`]
    ResolveBeacons { session: u64, fix: LocationFix },
    /// Send `batch`; answer with [`Input::SyncFinished`]
    Transmit(SyncBatch),
}

pub struct FusionCore {
    config: FusionConfig,
    gps: GpsController,
    beacons: BeaconAggregator,
    motion: MotionClassifier,
    sync: SyncBuffer,
    transport_attached: bool,
    /// `start_tracking` was called and not yet undone
    requested: bool,
    /// Sub-trackers are live
    tracking: bool,
    /// Bumped whenever the sub-trackers start or stop
    session: u64,
    authorization: Option<AuthorizationStatus>,
    host: HostState,
    server_connected: bool,
}

impl FusionCore {
    pub fn new(
        config: FusionConfig,
        gps: GpsController,
        beacons: BeaconAggregator,
        motion: MotionClassifier,
        sync: SyncBuffer,
        transport_attached: bool,
    ) -> Self {
        Self {
            config,
            gps,
            beacons,
            motion,
            sync,
            transport_attached,
            requested: false,
            tracking: false,
            session: 0,
            authorization: None,
            host: HostState::Foreground,
            server_connected: false,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn gps_mode(&self) -> GpsMode {
        self.gps.mode()
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion.state()
    }

    pub fn monitored_uuids(&self) -> &[String] {
        self.beacons.monitored_uuids()
    }

    pub fn sync_buffer(&self) -> &SyncBuffer {
        &self.sync
    }

    pub fn handle(&mut self, input: Input, now: OffsetDateTime) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Command(Command::StartTracking) => self.start_tracking(&mut out),
            Input::Command(Command::StopTracking) => self.stop_tracking(&mut out),
            Input::Command(Command::SyncNow) => self.evaluate_sync(&mut out, now, true),
            Input::Sensor(sensor) => self.on_sensor(sensor, &mut out, now),
            Input::Resolved { session, result } => self.on_resolved(session, result),
            Input::SyncFinished { kind, sent, result } => {
                self.sync.complete(kind, sent, &result, now);
                let event = match result {
                    Ok(()) => TrackerEvent::SyncCompleted { kind, count: sent },
                    Err(e) => TrackerEvent::SyncFailed {
                        kind,
                        error: e.to_string(),
                    },
                };
                out.push(Action::Notify(event));
            }
        }
        out
    }

    fn on_sensor(&mut self, input: SensorInput, out: &mut Vec<Action>, now: OffsetDateTime) {
        match input {
            SensorInput::Authorization(status) => self.on_authorization(status, out),
            SensorInput::Locations(fixes) => {
                if !self.tracking {
                    return;
                }
                for fix in fixes {
                    if let Some(accepted) = self.gps.on_raw_fix(fix) {
                        self.on_accepted_fix(accepted, out);
                    }
                }
                self.evaluate_sync(out, now, false);
            }
            SensorInput::Sightings(sightings) => {
                if !self.tracking {
                    return;
                }
                if let Some(fixes) = self.beacons.on_sightings(sightings, self.motion.state()) {
                    self.on_beacon_fixes(fixes, out);
                    self.evaluate_sync(out, now, false);
                }
            }
            SensorInput::Acceleration(sample) => {
                if !self.tracking {
                    return;
                }
                if let Some(state) = self.motion.on_sample(&sample) {
                    info!("Device is now {}", state);
                    // Groupings must not span two motion states
                    let fixes = self.beacons.flush();
                    self.on_beacon_fixes(fixes, out);
                    out.push(Action::Notify(TrackerEvent::MotionChanged(state)));
                    self.evaluate_sync(out, now, false);
                }
            }
            SensorInput::Battery(status) => {
                debug!("Battery {:?} at {:?}", status.state, status.level);
                self.gps.on_battery(status);
            }
            SensorInput::AppState(host) => {
                self.on_host_state(host, out);
                self.evaluate_sync(out, now, false);
            }
            SensorInput::ServerPosition(fix) => {
                self.server_connected = true;
                if self.tracking {
                    out.push(Action::Notify(TrackerEvent::PositionChanged {
                        fix,
                        source: PositionSource::Server,
                    }));
                }
            }
        }
    }

    fn start_tracking(&mut self, out: &mut Vec<Action>) {
        self.requested = true;
        if self.tracking {
            return;
        }

        let status = self.gps.authorization();
        if status.is_granted() {
            self.begin(out);
        } else {
            info!("Location not authorized ({:?}), waiting for permission", status);
            self.gps.request_authorization();
        }
    }

    fn stop_tracking(&mut self, out: &mut Vec<Action>) {
        self.requested = false;
        if self.tracking {
            self.halt(out);
            out.push(Action::Notify(TrackerEvent::TrackingStopped));
        }
    }

    /// Start the sub-trackers from low-power GPS.
    fn begin(&mut self, out: &mut Vec<Action>) {
        self.tracking = true;
        self.session += 1;
        info!("Tracking started (session {})", self.session);
        out.push(Action::Notify(TrackerEvent::TrackingStarted));

        let before = self.gps.mode();
        self.gps.start_low_power();
        self.note_gps_mode(before, out);
    }

    /// Stop every sub-tracker. Completions of the old session become stale.
    fn halt(&mut self, out: &mut Vec<Action>) {
        let before = self.gps.mode();
        self.gps.stop_all();
        self.beacons.reset();
        self.motion.stop();
        self.tracking = false;
        self.session += 1;
        info!("Tracking stopped");
        self.note_gps_mode(before, out);
    }

    fn on_authorization(&mut self, status: AuthorizationStatus, out: &mut Vec<Action>) {
        if self.authorization == Some(status) {
            return;
        }
        self.authorization = Some(status);
        info!("Location authorization is now {:?}", status);
        out.push(Action::Notify(TrackerEvent::AuthorizationChanged(status)));

        if !self.requested {
            return;
        }
        if status.is_granted() {
            if self.tracking {
                self.halt(out);
            }
            self.begin(out);
        } else if self.tracking {
            warn!("Location authorization revoked, tracking paused");
            self.halt(out);
            out.push(Action::Notify(TrackerEvent::TrackingStopped));
        }
    }

    fn on_accepted_fix(&mut self, fix: LocationFix, out: &mut Vec<Action>) {
        debug!(
            "Accepted fix {:.6}, {:.6} (±{:.0} m)",
            fix.latitude, fix.longitude, fix.horizontal_accuracy
        );
        if let Err(e) = self.sync.append_location(&fix) {
            error!("Failed to queue location fix: {}", e);
        }

        out.push(Action::ResolveBeacons {
            session: self.session,
            fix: fix.clone(),
        });
        self.motion.start();

        if self.config.prefer_server_positions && self.server_connected {
            debug!("Server positions preferred, device fix not surfaced");
        } else {
            out.push(Action::Notify(TrackerEvent::PositionChanged {
                fix,
                source: PositionSource::Device,
            }));
        }
    }

    fn on_resolved(&mut self, session: u64, result: Result<Vec<String>, ResolveError>) {
        if !self.tracking || session != self.session {
            debug!("Dropping stale beacon lookup from session {}", session);
            return;
        }
        match result {
            Ok(uuids) => self.beacons.start_monitoring(&uuids),
            Err(e) => warn!("Beacon lookup failed, monitoring skipped: {}", e),
        }
    }

    fn on_beacon_fixes(&mut self, fixes: Vec<BeaconFix>, out: &mut Vec<Action>) {
        let before = self.gps.mode();

        if self.is_beacon_proximate(&fixes) {
            self.gps.stop_precise();
            self.gps.start_low_power();
            self.note_gps_mode(before, out);

            if let Err(e) = self.sync.append_beacons(&fixes) {
                error!("Failed to queue beacon fixes: {}", e);
            }
            out.push(Action::Notify(TrackerEvent::BeaconsRanged(fixes)));
        } else {
            self.gps.stop_low_power();
            self.gps.start_precise();
            self.note_gps_mode(before, out);
        }
    }

    fn is_beacon_proximate(&self, fixes: &[BeaconFix]) -> bool {
        let known = fixes.iter().filter(|f| f.proximity.is_known()).count();
        let immediate = self.config.immediate_is_proximate
            && fixes.iter().any(|f| f.proximity == Proximity::Immediate);
        !fixes.is_empty() && (known >= self.config.min_known_for_proximate || immediate)
    }

    fn on_host_state(&mut self, host: HostState, out: &mut Vec<Action>) {
        if self.host == host {
            return;
        }
        self.host = host;
        debug!("Host moved to {:?}", host);

        if !self.tracking || !self.config.reduce_when_backgrounded {
            return;
        }
        let before = self.gps.mode();
        match host {
            HostState::Background if !self.gps.is_precise() => self.gps.start_low_power(),
            HostState::Foreground if self.gps.is_precise() => self.gps.stop_low_power(),
            _ => {}
        }
        self.note_gps_mode(before, out);
    }

    fn evaluate_sync(&mut self, out: &mut Vec<Action>, now: OffsetDateTime, force: bool) {
        if !self.transport_attached {
            return;
        }
        for batch in self.sync.due_batches(self.host, now, force) {
            out.push(Action::Transmit(batch));
        }
    }

    fn note_gps_mode(&self, before: GpsMode, out: &mut Vec<Action>) {
        let after = self.gps.mode();
        if after != before {
            out.push(Action::Notify(TrackerEvent::GpsModeChanged(after)));
        }
    }
}
