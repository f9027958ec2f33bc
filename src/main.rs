use log::{error, info, warn};

use fusion_tracker::replay::{Replay, ReplayMotionProvider};
use fusion_tracker::utils::format_datetime;
use fusion_tracker::{
    EventStream, JsonFileStore, PositionSource, ServiceConfig, StaticResolver, Tracker,
    TrackerBuilder, TrackerEvent,
};

#[cfg(feature = "bluetooth")]
use fusion_tracker::bluetooth::BleBeaconScanner;
#[cfg(feature = "postgres")]
use fusion_tracker::database::PostgresTransport;
use fusion_tracker::providers::FixedLocationProvider;

/// Log every event until the tracker shuts down
async fn event_loop(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            TrackerEvent::TrackingStarted => info!("Tracking started"),
            TrackerEvent::TrackingStopped => info!("Tracking stopped"),
            TrackerEvent::AuthorizationChanged(status) => {
                info!("Location authorization: {:?}", status)
            }
            TrackerEvent::PositionChanged { fix, source } => {
                let source = match source {
                    PositionSource::Device => "device",
                    PositionSource::Server => "server",
                };
                info!(
                    "Position ({}) {:.6}, {:.6} ±{:.0} m at {}",
                    source,
                    fix.latitude,
                    fix.longitude,
                    fix.horizontal_accuracy,
                    format_datetime(&fix.timestamp)
                );
            }
            TrackerEvent::MotionChanged(state) => info!("Device is {}", state),
            TrackerEvent::BeaconsRanged(fixes) => {
                info!("Ranged {} beacon(s):", fixes.len());
                for fix in &fixes {
                    info!(
                        "  {}: {:.1} dB, {} ({} samples)",
                        fix.key,
                        fix.rssi,
                        fix.proximity.as_str(),
                        fix.samples
                    );
                }
            }
            TrackerEvent::GpsModeChanged(mode) => info!("GPS mode: {:?}", mode),
            TrackerEvent::SyncCompleted { kind, count } => {
                info!("Successfully synced {} {}", count, kind)
            }
            TrackerEvent::SyncFailed { kind, error } => {
                warn!("Failed to sync {}: {}", kind, error)
            }
        }
    }
}

fn with_transport(builder: TrackerBuilder, config: &ServiceConfig) -> TrackerBuilder {
    let Some(database_url) = &config.database_url else {
        info!("DATABASE_URL not set, running in local mode");
        return builder;
    };

    #[cfg(feature = "postgres")]
    {
        builder.transport(PostgresTransport::new(
            database_url,
            &config.device_id,
            &config.user_id,
        ))
    }
    #[cfg(not(feature = "postgres"))]
    {
        warn!(
            "Built without postgres support, ignoring {} and running in local mode",
            database_url
        );
        builder
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ServiceConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let replay = match &config.replay_file {
        Some(path) => Some(Replay::open(path)?),
        None => None,
    };

    let builder = Tracker::builder(config.tracker.clone())
        .resolver(StaticResolver::new(config.beacon_uuids.clone()))
        .store(JsonFileStore::new(&config.cache_dir)?)
        .motion_provider(ReplayMotionProvider);
    let sink = builder.sink();

    let builder = match (&replay, config.fixed_position) {
        (Some(replay), _) => builder.location_provider(replay.location_provider()),
        (None, Some((latitude, longitude))) => {
            builder.location_provider(FixedLocationProvider::new(sink.clone(), latitude, longitude))
        }
        (None, None) => {
            error!("Set REPLAY_FILE or FIXED_POSITION to provide a location source");
            return Err("no location source configured".into());
        }
    };

    #[cfg(feature = "bluetooth")]
    let builder = builder.beacon_provider(BleBeaconScanner::new(sink.clone())?);
    #[cfg(not(feature = "bluetooth"))]
    let builder = builder.beacon_provider(fusion_tracker::replay::ReplayBeaconProvider);

    let builder = with_transport(builder, &config);
    let (tracker, events) = builder.spawn()?;
    tracker.start_tracking()?;

    if let Some(replay) = replay {
        let speed = config.replay_speed;
        tokio::spawn(async move {
            if let Err(e) = replay.run(sink, speed).await {
                error!("Replay stopped: {}", e);
            }
        });
    }

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        let _ = tx.send(());
    });

    // Log events or wait for shutdown signal
    tokio::select! {
        _ = event_loop(events) => {
            info!("Event stream closed");
        }
        _ = &mut rx => {
            info!("Program terminated by user. Flushing queues and exiting gracefully.");
        }
    }

    tracker.sync_now()?;
    tracker.shutdown().await?;

    Ok(())
}
