/// Bluetooth Low Energy scanning for iBeacons
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::ibeacon::{decode_ibeacon, APPLE_COMPANY_ID};
use crate::error::TrackerError;
use crate::models::BeaconSighting;
use crate::providers::BeaconProvider;
use crate::runtime::SensorSink;

const SCAN_WINDOW_SECS: u64 = 2; // How long each discovery burst runs
const RETRY_DELAY_SECS: u64 = 10; // Pause after the adapter failed

/// Beacon provider ranging iBeacons through BlueZ.
///
/// Each call to `start_monitoring` spawns a scan task that repeatedly runs
/// a short discovery burst and pushes the sightings of monitored UUIDs into
/// the sink, one batch per burst. Stopping aborts the task.
pub struct BleBeaconScanner {
    runtime: Handle,
    sink: SensorSink,
    window: Duration,
    task: Option<JoinHandle<()>>,
}

impl BleBeaconScanner {
    pub fn new(sink: SensorSink) -> Result<Self, TrackerError> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        Ok(BleBeaconScanner {
            runtime,
            sink,
            window: Duration::from_secs(SCAN_WINDOW_SECS),
            task: None,
        })
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

impl BeaconProvider for BleBeaconScanner {
    fn start_monitoring(&mut self, uuids: &[String]) {
        self.stop_monitoring();
        let uuids = uuids.to_vec();
        let sink = self.sink.clone();
        let window = self.window;
        self.task = Some(self.runtime.spawn(scan_loop(uuids, sink, window)));
    }

    fn stop_monitoring(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("BLE scan task stopped");
        }
    }
}

impl Drop for BleBeaconScanner {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

async fn scan_loop(uuids: Vec<String>, sink: SensorSink, window: Duration) {
    info!("Scanning for {} beacon UUID(s)", uuids.len());
    loop {
        match scan_window(&uuids, window).await {
            Ok(sightings) if sightings.is_empty() => debug!("No monitored beacons in range"),
            Ok(sightings) => {
                debug!("Ranged {} beacon(s)", sightings.len());
                if sink.sightings(sightings).is_err() {
                    info!("Tracker gone, ending BLE scan");
                    return;
                }
            }
            Err(e) => {
                error!("Beacon scan failed: {}", e);
                sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
            }
        }
    }
}

/// Run one discovery burst and collect the iBeacons of interest
async fn scan_window(uuids: &[String], window: Duration) -> bluer::Result<Vec<BeaconSighting>> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let filter = bluer::DiscoveryFilter {
        transport: bluer::DiscoveryTransport::Le,
        // Every advertisement refreshes the RSSI
        duplicate_data: true,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let mut discovery = Box::pin(adapter.discover_devices().await?);
    let burst = sleep(window);
    tokio::pin!(burst);
    loop {
        tokio::select! {
            event = discovery.next() => match event {
                Some(event) => debug!("Discovery event: {:?}", event),
                None => break,
            },
            _ = &mut burst => break,
        }
    }

    // BlueZ forgets RSSI once discovery stops, so read while it still runs
    let sightings = collect_sightings(&adapter, uuids).await;
    drop(discovery);
    sightings
}

async fn collect_sightings(
    adapter: &bluer::Adapter,
    uuids: &[String],
) -> bluer::Result<Vec<BeaconSighting>> {
    let now = OffsetDateTime::now_utc();
    let mut sightings = Vec::new();
    for addr in adapter.device_addresses().await? {
        let device = match adapter.device(addr) {
            Ok(device) => device,
            Err(_) => continue,
        };

        let payload = match device.manufacturer_data().await {
            Ok(Some(data)) => match data.get(&APPLE_COMPANY_ID) {
                Some(payload) => payload.clone(),
                None => continue,
            },
            Ok(None) => continue,
            Err(e) => {
                debug!("Failed to get manufacturer data for {}: {}", addr, e);
                continue;
            }
        };

        let Some(frame) = decode_ibeacon(&payload) else {
            continue;
        };
        if !uuids.contains(&frame.uuid) {
            continue;
        }

        let rssi = device.rssi().await.ok().flatten();
        sightings.push(frame.sighting(rssi, now));
    }

    Ok(sightings)
}
