//! Error types for the fusion tracker

use thiserror::Error;

/// Errors returned to callers of the tracker API.
///
/// These are programmer errors: the tracker was built without a required
/// collaborator, or a command was sent after the delivery task stopped.
/// Sensor, resolver and transport failures never surface here.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Tracker is not running")]
    NotRunning,

    #[error("Tracker must be spawned inside a tokio runtime")]
    NoRuntime,
}

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid beacon UUID: '{0}'")]
    InvalidUuid(String),
}

/// Errors raised by a batch store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt batch file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a transport when a batch could not be delivered.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Remote rejected batch: {0}")]
    Rejected(String),
}

/// Errors reported by a beacon UUID resolver.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("No beacon UUIDs known for this position")]
    NoBeacons,

    #[error("Beacon lookup failed: {0}")]
    Lookup(String),
}

/// Errors raised while loading a replay file.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read replay file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid replay record on line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}
