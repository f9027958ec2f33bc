pub mod beacons;
pub mod fusion;
pub mod gps;
pub mod motion;
pub mod smoothing;

pub use beacons::BeaconAggregator;
pub use fusion::{Action, Command, FusionCore, Input, SensorInput, TrackerEvent};
pub use gps::GpsController;
pub use motion::MotionClassifier;
pub use smoothing::{MeanSmoother, MedianSmoother, SignalSmoother};
