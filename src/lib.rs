//! kaibridge
//!
//! Bridges PlayStation Portable / PlayStation Vita ad-hoc wireless traffic
//! between a monitor-mode capture interface and the XLink Kai tunneling
//! service.
//!
//! - `wireless`: radiotap + 802.11 parsing, 802.11 <-> 802.3 conversion,
//!   SSID/BSSID session lock-on, nl80211 shim
//! - `capture`: pcap-backed capture device variants
//! - `xlink`: UDP client for the XLink Kai e-info protocol
//! - `engine`: lifecycle state machine behind the control surface
//! - `config`: TOML configuration

pub mod capture;
pub mod config;
pub mod engine;
pub mod wireless;
pub mod xlink;

pub use config::Config;
pub use engine::{Command, ControlModel, Engine, EngineStatus};
pub use xlink::XLinkKaiConnection;
