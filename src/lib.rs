//! Power-aware fusion of GPS, beacon and motion sensing.
//!
//! A [`Tracker`] decides which acquisition mode each sensor runs in, smooths
//! beacon signal strength into per-beacon fixes, gates location fixes on
//! distance and age, and queues everything it reports for threshold-based
//! transmission to a remote service.
//!
//! ```no_run
//! use fusion_tracker::replay::{Replay, ReplayBeaconProvider, ReplayMotionProvider};
//! use fusion_tracker::{StaticResolver, Tracker, TrackerConfig};
//!
//! # async fn demo(replay: Replay) -> Result<(), Box<dyn std::error::Error>> {
//! let builder = Tracker::builder(TrackerConfig::default())
//!     .location_provider(replay.location_provider())
//!     .beacon_provider(ReplayBeaconProvider)
//!     .motion_provider(ReplayMotionProvider)
//!     .resolver(StaticResolver::new(vec![
//!         "f7826da6-4fa2-4e98-8024-bc5b71e0893e".to_string(),
//!     ]));
//! let sink = builder.sink();
//! let (tracker, mut events) = builder.spawn()?;
//!
//! tracker.start_tracking()?;
//! tokio::spawn(replay.run(sink, 1.0));
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bluetooth;
pub mod config;
#[cfg(feature = "postgres")]
pub mod database;
pub mod error;
pub mod models;
pub mod providers;
pub mod replay;
pub mod runtime;
pub mod sync;
pub mod tracking;
pub mod utils;

pub use config::{ServiceConfig, TrackerConfig};
pub use error::{ConfigError, ReplayError, ResolveError, StorageError, TrackerError, TransportError};
pub use models::*;
pub use providers::{
    BeaconProvider, BeaconUuidResolver, LocationProvider, MotionProvider, StaticResolver,
    Transport,
};
pub use runtime::{EventStream, SensorSink, Tracker, TrackerBuilder};
pub use sync::{BatchStore, JsonFileStore, MemoryStore, SyncBuffer};
pub use tracking::{Command, SensorInput, TrackerEvent};
