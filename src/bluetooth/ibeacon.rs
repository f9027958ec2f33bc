/// iBeacon advertisement decoding
use log::debug;
use std::fmt::Write;
use time::OffsetDateTime;

use crate::models::{BeaconKey, BeaconSighting, Proximity, SignalStrength};

// iBeacon protocol constants
pub const APPLE_COMPANY_ID: u16 = 0x004C; // Apple Inc. manufacturer ID
const IBEACON_TYPE: u8 = 0x02;
const IBEACON_LENGTH: u8 = 0x15; // 21 bytes follow the type/length header
const FRAME_LEN: usize = 23;

/// Identity and calibration advertised by one beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IBeaconFrame {
    /// Lowercase, hyphenated
    pub uuid: String,
    pub major: u16,
    pub minor: u16,
    /// Calibrated RSSI at one metre
    pub tx_power: i8,
}

impl IBeaconFrame {
    /// Build a sighting from this frame and the RSSI measured by the adapter.
    pub fn sighting(&self, rssi: Option<i16>, timestamp: OffsetDateTime) -> BeaconSighting {
        let strength = SignalStrength::from(rssi.map(f64::from).unwrap_or(0.0));
        BeaconSighting {
            key: BeaconKey::new(&self.uuid, self.major, self.minor),
            rssi: strength,
            proximity: Proximity::estimate(strength, self.tx_power),
            timestamp,
        }
    }
}

/// Decode Apple manufacturer data into an iBeacon frame
///
/// The payload (company ID already stripped) is laid out as:
/// - Byte 0: Type (0x02)
/// - Byte 1: Remaining length (0x15)
/// - Bytes 2-17: Proximity UUID
/// - Bytes 18-19: Major (big-endian)
/// - Bytes 20-21: Minor (big-endian)
/// - Byte 22: TX power (signed)
///
/// Returns None for any other Apple advertisement.
pub fn decode_ibeacon(data: &[u8]) -> Option<IBeaconFrame> {
    if data.len() < FRAME_LEN || data[0] != IBEACON_TYPE || data[1] != IBEACON_LENGTH {
        if !data.is_empty() {
            debug!(
                "Not an iBeacon frame: len={}, type={:#04x}",
                data.len(),
                data[0]
            );
        }
        return None;
    }

    Some(IBeaconFrame {
        uuid: format_uuid(&data[2..18]),
        major: u16::from_be_bytes([data[18], data[19]]),
        minor: u16::from_be_bytes([data[20], data[21]]),
        tx_power: i8::from_be_bytes([data[22]]),
    })
}

fn format_uuid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
