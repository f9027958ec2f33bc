/// Moving/standing classification from accelerometer samples
use log::{debug, info};
use time::OffsetDateTime;

use crate::config::MotionConfig;
use crate::models::{AccelerationSample, MotionState};
use crate::providers::MotionProvider;
use crate::utils::elapsed;

/// Binary motion state machine with hysteresis.
///
/// Owns the only live [`MotionState`]. A transition is confirmed once the
/// opposite activity has been observed without interruption for the configured
/// delay; any sample that agrees with the current state cancels the pending
/// transition.
pub struct MotionClassifier {
    config: MotionConfig,
    provider: Box<dyn MotionProvider>,
    sampling: bool,
    state: MotionState,
    pending_since: Option<OffsetDateTime>,
}

impl MotionClassifier {
    pub fn new(config: MotionConfig, provider: Box<dyn MotionProvider>) -> Self {
        Self {
            config,
            provider,
            sampling: false,
            state: MotionState::Standing,
            pending_since: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    /// Begin sampling. No-op when already sampling or when there is no motion hardware.
    pub fn start(&mut self) {
        if self.sampling {
            return;
        }
        if !self.provider.is_available() {
            debug!("Motion hardware unavailable, classifier stays off");
            return;
        }
        self.provider.start_sampling(self.config.sample_interval);
        self.sampling = true;
        self.pending_since = None;
        info!("Motion classifier started");
    }

    /// Stop sampling. No-op when already stopped.
    pub fn stop(&mut self) {
        if !self.sampling {
            return;
        }
        self.provider.stop_sampling();
        self.sampling = false;
        self.pending_since = None;
        info!("Motion classifier stopped");
    }

    /// Feed one sample; returns the new state when a transition is confirmed.
    pub fn on_sample(&mut self, sample: &AccelerationSample) -> Option<MotionState> {
        if !self.sampling {
            return None;
        }

        let active = sample.exceeds(self.config.activity_threshold);
        let (target, delay) = match (self.state, active) {
            (MotionState::Standing, true) => (MotionState::Moving, self.config.moving_delay),
            (MotionState::Moving, false) => (MotionState::Standing, self.config.standing_delay),
            _ => {
                // Sample agrees with the current state
                self.pending_since = None;
                return None;
            }
        };

        let Some(since) = self.pending_since else {
            self.pending_since = Some(sample.timestamp);
            return None;
        };

        if elapsed(since, sample.timestamp) >= delay {
            debug!("Motion state {} -> {}", self.state, target);
            self.state = target;
            self.pending_since = None;
            Some(target)
        } else {
            None
        }
    }
}
