/// Postgres transport for synced batches
use async_trait::async_trait;
use log::info;
use tokio_postgres::Transaction;

use crate::database::connection::connect;
use crate::error::TransportError;
use crate::models::{BeaconFix, LocationFix, SyncBatch};
use crate::providers::Transport;

const INSERT_BEACON_FIX: &str = "INSERT INTO beacon_fixes(device_id, user_id, uuid, major, minor, rssi, proximity, samples, time)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const INSERT_LOCATION_FIX: &str = "INSERT INTO location_fixes(device_id, user_id, latitude, longitude, altitude, heading, horizontal_accuracy, vertical_accuracy, time)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

/// Writes every batch in a single transaction.
///
/// Each `send` opens its own connection and makes exactly one attempt;
/// retrying is left to the sync policy.
#[derive(Debug, Clone)]
pub struct PostgresTransport {
    database_url: String,
    device_id: String,
    user_id: String,
}

impl PostgresTransport {
    pub fn new(database_url: &str, device_id: &str, user_id: &str) -> Self {
        PostgresTransport {
            database_url: database_url.to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
        }
    }

    async fn store_beacon_fixes(
        &self,
        transaction: &Transaction<'_>,
        fixes: &[BeaconFix],
    ) -> Result<(), tokio_postgres::Error> {
        let statement = transaction.prepare(INSERT_BEACON_FIX).await?;
        for fix in fixes {
            let samples = i32::try_from(fix.samples).unwrap_or(i32::MAX);
            transaction
                .execute(
                    &statement,
                    &[
                        &self.device_id,
                        &self.user_id,
                        &fix.key.uuid,
                        &i32::from(fix.key.major),
                        &i32::from(fix.key.minor),
                        &fix.rssi,
                        &fix.proximity.as_str(),
                        &samples,
                        &fix.timestamp,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn store_location_fixes(
        &self,
        transaction: &Transaction<'_>,
        fixes: &[LocationFix],
    ) -> Result<(), tokio_postgres::Error> {
        let statement = transaction.prepare(INSERT_LOCATION_FIX).await?;
        for fix in fixes {
            transaction
                .execute(
                    &statement,
                    &[
                        &self.device_id,
                        &self.user_id,
                        &fix.latitude,
                        &fix.longitude,
                        &fix.altitude,
                        &fix.heading,
                        &fix.horizontal_accuracy,
                        &fix.vertical_accuracy,
                        &fix.timestamp,
                    ],
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    async fn send(&self, batch: &SyncBatch) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut client = connect(&self.database_url).await?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let stored = match batch {
            SyncBatch::Beacons(fixes) => self.store_beacon_fixes(&transaction, fixes).await,
            SyncBatch::Locations(fixes) => self.store_location_fixes(&transaction, fixes).await,
        };
        stored.map_err(|e| TransportError::Rejected(e.to_string()))?;

        transaction
            .commit()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        info!("Successfully stored {} {}", batch.len(), batch.kind());
        Ok(())
    }
}
