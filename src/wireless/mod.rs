//! 802.11 ad-hoc frame handling
//!
//! Everything needed to follow a PSP/Vita ad-hoc session from a monitor-mode
//! capture:
//! - radiotap parse/build
//! - 802.11 MAC primitives and LLC/SNAP
//! - 802.11 <-> 802.3 conversion and beacon parsing
//! - SSID filter + BSSID session lock
//! - nl80211 adapter shim

pub mod convert;
pub mod handler;
pub mod ieee80211;
pub mod interface;
pub mod radiotap;

pub use convert::{PacketConverter, WifiInformation};
pub use handler::Handler80211;
pub use ieee80211::MacAddr;
pub use interface::{WifiInterface, WirelessError};
pub use radiotap::{RadiotapHeader, RadiotapInfo};
