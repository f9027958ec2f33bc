pub mod ibeacon;
#[cfg(feature = "bluetooth")]
pub mod scanner;

pub use ibeacon::{decode_ibeacon, IBeaconFrame};
#[cfg(feature = "bluetooth")]
pub use scanner::BleBeaconScanner;
