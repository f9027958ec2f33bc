//! Tokio host for a [`FusionCore`].
//!
//! One delivery task owns the core. Commands from the [`Tracker`] handle and
//! observations from any number of [`SensorSink`] clones are queued on an
//! unbounded channel, so pushing never blocks and works from plain threads.
//! Resolver lookups and transmissions run as separate tasks whose results are
//! fed back into the same loop.

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TransportError};
use crate::models::{
    AccelerationSample, AuthorizationStatus, BatteryStatus, BeaconSighting, HostState,
    LocationFix,
};
use crate::providers::{
    BeaconProvider, BeaconUuidResolver, LocationProvider, MotionProvider, Transport,
};
use crate::sync::{BatchStore, MemoryStore, SyncBuffer};
use crate::tracking::{
    Action, BeaconAggregator, Command, FusionCore, GpsController, Input, MeanSmoother,
    MotionClassifier, SensorInput, SignalSmoother, TrackerEvent,
};

enum Message {
    Input(Input),
    Shutdown,
}

/// Handle for pushing observations into a running tracker. Cheap to clone.
#[derive(Clone)]
pub struct SensorSink {
    inputs: mpsc::UnboundedSender<Message>,
}

impl SensorSink {
    pub fn push(&self, input: SensorInput) -> Result<(), TrackerError> {
        self.inputs
            .send(Message::Input(Input::Sensor(input)))
            .map_err(|_| TrackerError::NotRunning)
    }

    pub fn location(&self, fix: LocationFix) -> Result<(), TrackerError> {
        self.push(SensorInput::Locations(vec![fix]))
    }

    pub fn locations(&self, fixes: Vec<LocationFix>) -> Result<(), TrackerError> {
        self.push(SensorInput::Locations(fixes))
    }

    pub fn authorization(&self, status: AuthorizationStatus) -> Result<(), TrackerError> {
        self.push(SensorInput::Authorization(status))
    }

    pub fn sightings(&self, sightings: Vec<BeaconSighting>) -> Result<(), TrackerError> {
        self.push(SensorInput::Sightings(sightings))
    }

    pub fn acceleration(&self, sample: AccelerationSample) -> Result<(), TrackerError> {
        self.push(SensorInput::Acceleration(sample))
    }

    pub fn battery(&self, status: BatteryStatus) -> Result<(), TrackerError> {
        self.push(SensorInput::Battery(status))
    }

    pub fn app_state(&self, host: HostState) -> Result<(), TrackerError> {
        self.push(SensorInput::AppState(host))
    }

    pub fn server_position(&self, fix: LocationFix) -> Result<(), TrackerError> {
        self.push(SensorInput::ServerPosition(fix))
    }
}

/// Receiving end of the events of one tracker.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<TrackerEvent>,
}

impl EventStream {
    /// Next event, or `None` once the tracker has shut down and everything was read.
    pub async fn recv(&mut self) -> Option<TrackerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TrackerEvent> {
        self.events.try_recv().ok()
    }
}

/// Collects the collaborators of a tracker before spawning it.
pub struct TrackerBuilder {
    config: TrackerConfig,
    inputs: mpsc::UnboundedSender<Message>,
    receiver: mpsc::UnboundedReceiver<Message>,
    location: Option<Box<dyn LocationProvider>>,
    beacons: Option<Box<dyn BeaconProvider>>,
    motion: Option<Box<dyn MotionProvider>>,
    resolver: Option<Arc<dyn BeaconUuidResolver>>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Box<dyn BatchStore>>,
    smoother: Option<Box<dyn SignalSmoother>>,
}

impl TrackerBuilder {
    pub fn location_provider(mut self, provider: impl LocationProvider + 'static) -> Self {
        self.location = Some(Box::new(provider));
        self
    }

    pub fn beacon_provider(mut self, provider: impl BeaconProvider + 'static) -> Self {
        self.beacons = Some(Box::new(provider));
        self
    }

    pub fn motion_provider(mut self, provider: impl MotionProvider + 'static) -> Self {
        self.motion = Some(Box::new(provider));
        self
    }

    pub fn resolver(mut self, resolver: impl BeaconUuidResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Without a transport the tracker runs in local mode and only queues.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Defaults to a [`MemoryStore`].
    pub fn store(mut self, store: impl BatchStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Defaults to [`MeanSmoother`].
    pub fn smoother(mut self, smoother: impl SignalSmoother + 'static) -> Self {
        self.smoother = Some(Box::new(smoother));
        self
    }

    /// Sink for the tracker being built. Providers can hold it before `spawn`.
    pub fn sink(&self) -> SensorSink {
        SensorSink {
            inputs: self.inputs.clone(),
        }
    }

    /// Start the delivery task on the current tokio runtime.
    pub fn spawn(self) -> Result<(Tracker, EventStream), TrackerError> {
        let location = self
            .location
            .ok_or(TrackerError::MissingCollaborator("location provider"))?;
        let beacons = self
            .beacons
            .ok_or(TrackerError::MissingCollaborator("beacon provider"))?;
        let motion = self
            .motion
            .ok_or(TrackerError::MissingCollaborator("motion provider"))?;
        let resolver = self
            .resolver
            .ok_or(TrackerError::MissingCollaborator("beacon UUID resolver"))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;

        let config = self.config;
        let smoother = self.smoother.unwrap_or_else(|| Box::new(MeanSmoother));
        let store = self
            .store
            .unwrap_or_else(|| Box::new(MemoryStore::new()));

        if self.transport.is_none() {
            info!("No transport configured, samples stay queued locally");
        }

        let core = FusionCore::new(
            config.fusion,
            GpsController::new(config.gps, location),
            BeaconAggregator::with_smoother(config.beacons, beacons, smoother),
            MotionClassifier::new(config.motion, motion),
            SyncBuffer::new(config.sync, store),
            self.transport.is_some(),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let delivery = DeliveryLoop {
            core,
            events: event_tx,
            resolver,
            transport: self.transport,
            lookups: JoinSet::new(),
            transmissions: JoinSet::new(),
        };
        let task = runtime.spawn(delivery.run(self.receiver));

        Ok((
            Tracker {
                inputs: self.inputs,
                task,
            },
            EventStream { events: event_rx },
        ))
    }
}

/// Owner handle of a running tracker.
pub struct Tracker {
    inputs: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        let (inputs, receiver) = mpsc::unbounded_channel();
        TrackerBuilder {
            config,
            inputs,
            receiver,
            location: None,
            beacons: None,
            motion: None,
            resolver: None,
            transport: None,
            store: None,
            smoother: None,
        }
    }

    pub fn start_tracking(&self) -> Result<(), TrackerError> {
        self.command(Command::StartTracking)
    }

    pub fn stop_tracking(&self) -> Result<(), TrackerError> {
        self.command(Command::StopTracking)
    }

    /// Transmit every non-empty queue now, ignoring thresholds.
    pub fn sync_now(&self) -> Result<(), TrackerError> {
        self.command(Command::SyncNow)
    }

    pub fn sink(&self) -> SensorSink {
        SensorSink {
            inputs: self.inputs.clone(),
        }
    }

    /// Stop tracking, wait for transmissions already under way, and end the delivery task.
    pub async fn shutdown(self) -> Result<(), TrackerError> {
        self.inputs
            .send(Message::Shutdown)
            .map_err(|_| TrackerError::NotRunning)?;
        self.task.await.map_err(|e| {
            error!("Delivery task failed: {}", e);
            TrackerError::NotRunning
        })
    }

    fn command(&self, command: Command) -> Result<(), TrackerError> {
        self.inputs
            .send(Message::Input(Input::Command(command)))
            .map_err(|_| TrackerError::NotRunning)
    }
}

struct DeliveryLoop {
    core: FusionCore,
    events: mpsc::UnboundedSender<TrackerEvent>,
    resolver: Arc<dyn BeaconUuidResolver>,
    transport: Option<Arc<dyn Transport>>,
    lookups: JoinSet<Input>,
    transmissions: JoinSet<Input>,
}

impl DeliveryLoop {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Message>) {
        debug!("Delivery task running");
        let mut shutting_down = false;

        loop {
            let input = tokio::select! {
                Some(message) = inputs.recv(), if !shutting_down => match message {
                    Message::Input(input) => input,
                    Message::Shutdown => {
                        info!("Shutting down tracker");
                        shutting_down = true;
                        self.lookups.abort_all();
                        Input::Command(Command::StopTracking)
                    }
                },
                Some(joined) = self.lookups.join_next() => match joined {
                    Ok(input) => input,
                    Err(e) => {
                        if !e.is_cancelled() {
                            error!("Beacon lookup task failed: {}", e);
                        }
                        continue;
                    }
                },
                Some(joined) = self.transmissions.join_next() => match joined {
                    Ok(input) => input,
                    Err(e) => {
                        error!("Transmission task failed: {}", e);
                        continue;
                    }
                },
                else => break,
            };

            let actions = self.core.handle(input, OffsetDateTime::now_utc());
            self.dispatch(actions);
        }

        debug!("Delivery task finished");
    }

    fn dispatch(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => {
                    if self.events.send(event).is_err() {
                        debug!("Event stream dropped, event discarded");
                    }
                }
                Action::ResolveBeacons { session, fix } => {
                    let resolver = self.resolver.clone();
                    self.lookups.spawn(async move {
                        let result = resolver.beacon_uuids(&fix).await;
                        Input::Resolved { session, result }
                    });
                }
                Action::Transmit(batch) => {
                    let Some(transport) = self.transport.clone() else {
                        warn!("Dropping transmit request without transport");
                        continue;
                    };
                    self.transmissions.spawn(async move {
                        let kind = batch.kind();
                        let sent = batch.len();
                        // A panicking transport must still release the in-flight kind
                        let result = match AssertUnwindSafe(transport.send(&batch))
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                error!("Transport panicked while sending {} {}", sent, kind);
                                Err(TransportError::Connection("transport panicked".to_string()))
                            }
                        };
                        Input::SyncFinished { kind, sent, result }
                    });
                }
            }
        }
    }
}
