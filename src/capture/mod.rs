//! Capture devices
//!
//! Two pcap-backed device variants share the [`CaptureDevice`] contract:
//! - [`MonitorDevice`]: generic ad-hoc capture with BSSID lock-on and
//!   optional data-frame acknowledgement
//! - [`WirelessPspPluginDevice`]: tailored to the host-side PSP plugin,
//!   gated on the source MAC
//!
//! A device and an XLink Kai connection form a bridge; each side addresses
//! the other through a [`Connector`] weak handle so closing either side
//! breaks the cycle deterministically.

use std::sync::Weak;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod monitor;
pub mod psp_plugin;

pub use monitor::MonitorDevice;
pub use psp_plugin::WirelessPspPluginDevice;

/// pcap snapshot length
pub const SNAPSHOT_LENGTH: i32 = 65535;

/// pcap read timeout for the monitor variant (ms)
pub const MONITOR_READ_TIMEOUT_MS: i32 = 10;

/// pcap read timeout for the PSP plugin variant (ms)
pub const PSP_PLUGIN_READ_TIMEOUT_MS: i32 = 1;

/// Outgoing sink for frames crossing the bridge. Implemented by the XLink
/// connection (upstream) and by the capture devices (downstream injection).
/// `send_frame` must not block on the peer's receive loop.
pub trait Connector: Send + Sync {
    fn send_frame(&self, data: &[u8]) -> anyhow::Result<()>;
}

/// Contract shared by the capture device variants.
pub trait CaptureDevice: Send + Sync {
    /// Open the adapter for capture. Fails with
    /// [`CaptureError::DeviceUnavailable`] if the adapter cannot be opened
    /// in the mode the variant needs.
    fn open(&self, name: &str, ssid_filters: &[String]) -> Result<(), CaptureError>;

    /// Stop the receiver thread, join it and release the handle. Safe to
    /// call in any state.
    fn close(&self);

    /// Spawn the single receiver thread. May be called once per open.
    fn start_receiver(&self) -> Result<(), CaptureError>;

    /// Attach the outgoing sink.
    fn set_connector(&self, connector: Weak<dyn Connector>);

    /// Inject an 802.3 frame (converted to 802.11 internally).
    fn send_frame(&self, data: &[u8]) -> Result<(), CaptureError>;

    /// BSSID of the locked session, 0 while unlocked.
    fn locked_bssid(&self) -> u64;

    /// Drop data frames whose transmitter MAC differs from `mac`
    /// (0 disables the gate).
    fn set_source_mac_filter(&self, _mac: u64) {}

    /// Answer accepted data frames with a synthesized ACK.
    fn set_acknowledge(&self, _acknowledge: bool) {}

    /// Counter snapshot.
    fn stats(&self) -> DeviceStats;

    /// Handle for the XLink side of the bridge.
    fn as_connector(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Connector>;
}

/// Device counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames read from the adapter
    pub received: u64,
    /// Data frames converted and pushed to the connector
    pub forwarded: u64,
    /// Frames dropped by the session/MAC gates
    pub dropped: u64,
    /// Structural mismatches during conversion
    pub malformed: u64,
    /// Frames injected into the adapter
    pub injected: u64,
}

/// Capture device variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Generic ad-hoc monitor-mode device
    Monitor,
    /// Host-side PSP plugin device
    PspPlugin,
    /// No-op device for tests
    Dummy,
}

/// Create a device for the given variant.
pub fn create_device(kind: DeviceKind) -> std::sync::Arc<dyn CaptureDevice> {
    match kind {
        DeviceKind::Monitor => std::sync::Arc::new(MonitorDevice::new()),
        DeviceKind::PspPlugin => std::sync::Arc::new(WirelessPspPluginDevice::new()),
        DeviceKind::Dummy => std::sync::Arc::new(DummyDevice::default()),
    }
}

/// Capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device not open")]
    NotOpen,

    #[error("receiver thread already running")]
    ReceiverAlreadyRunning,

    #[error("no locked ad-hoc session")]
    NoSession,

    #[error("malformed frame")]
    MalformedFrame,

    #[error("injection failed: {0}")]
    InjectionFailed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Test device: accepts every call and records injected frames.
#[derive(Default)]
pub struct DummyDevice {
    open: std::sync::atomic::AtomicBool,
    running: std::sync::atomic::AtomicBool,
    bssid: std::sync::atomic::AtomicU64,
    sent: parking_lot::Mutex<Vec<Vec<u8>>>,
    connector: parking_lot::RwLock<Option<Weak<dyn Connector>>>,
}

impl DummyDevice {
    /// Pretend a session with this BSSID is locked.
    pub fn set_locked_bssid(&self, bssid: u64) {
        self.bssid.store(bssid, std::sync::atomic::Ordering::Relaxed);
    }

    /// Frames handed to [`CaptureDevice::send_frame`].
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Push an upstream frame to the attached connector, as the receive
    /// loop would.
    pub fn emit_upstream(&self, data: &[u8]) -> anyhow::Result<()> {
        if let Some(connector) = self.connector.read().as_ref().and_then(Weak::upgrade) {
            connector.send_frame(data)?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Connector for DummyDevice {
    fn send_frame(&self, data: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().push(data.to_vec());
        Ok(())
    }
}

impl CaptureDevice for DummyDevice {
    fn open(&self, _name: &str, _ssid_filters: &[String]) -> Result<(), CaptureError> {
        self.open.store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, std::sync::atomic::Ordering::Relaxed);
        self.running.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    fn start_receiver(&self) -> Result<(), CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::NotOpen);
        }
        self.running.store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn set_connector(&self, connector: Weak<dyn Connector>) {
        *self.connector.write() = Some(connector);
    }

    fn send_frame(&self, data: &[u8]) -> Result<(), CaptureError> {
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn locked_bssid(&self) -> u64 {
        self.bssid.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            injected: self.sent.lock().len() as u64,
            ..Default::default()
        }
    }

    fn as_connector(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Connector> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_device_variants() {
        create_device(DeviceKind::Monitor);
        create_device(DeviceKind::PspPlugin);
        create_device(DeviceKind::Dummy);
    }

    #[test]
    fn test_dummy_device_lifecycle() {
        let device = DummyDevice::default();
        assert!(matches!(
            device.start_receiver(),
            Err(CaptureError::NotOpen)
        ));

        device.open("test0", &[]).unwrap();
        device.start_receiver().unwrap();
        assert!(device.is_running());

        CaptureDevice::send_frame(&device, &[1, 2, 3]).unwrap();
        assert_eq!(device.sent_frames(), vec![vec![1, 2, 3]]);

        device.close();
        assert!(!device.is_open());
        assert!(!device.is_running());
    }

    #[test]
    fn test_device_kind_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: DeviceKind,
        }
        let wrapper: Wrapper = toml::from_str("kind = \"psp_plugin\"").unwrap();
        assert_eq!(wrapper.kind, DeviceKind::PspPlugin);
    }
}
