//! PSP plugin capture device
//!
//! Variant for the host-side PSP plugin. The plugin pins the session to a
//! fixed BSSID convention, so the source-MAC allowlist is the primary
//! acceptance gate and no acknowledgements are needed. Emits a packet-count
//! line on the debug channel at a fixed cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::wireless::convert::{self, PacketConverter};
use crate::wireless::handler::Handler80211;
use crate::wireless::ieee80211::{Addresses, FrameControl};
use crate::wireless::radiotap::parse_radiotap;

use super::{
    CaptureDevice, CaptureError, Connector, DeviceStats, PSP_PLUGIN_READ_TIMEOUT_MS,
    SNAPSHOT_LENGTH,
};

/// Log a packet-count statistic every this many captured frames
const STATISTICS_INTERVAL: u64 = 1000;

/// Host-side PSP plugin device.
pub struct WirelessPspPluginDevice {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    handle: Mutex<Option<pcap::Capture<pcap::Active>>>,
    connected: AtomicBool,
    running: AtomicBool,
    handler: Handler80211,
    converter: RwLock<PacketConverter>,
    connector: RwLock<Option<Weak<dyn Connector>>>,
    source_mac: AtomicU64,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    injected: AtomicU64,
}

impl WirelessPspPluginDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                handle: Mutex::new(None),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                handler: Handler80211::default(),
                converter: RwLock::new(PacketConverter::new(true)),
                connector: RwLock::new(None),
                source_mac: AtomicU64::new(0),
                stats: Counters::default(),
            }),
            receiver: Mutex::new(None),
        }
    }
}

impl Default for WirelessPspPluginDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn receive_loop(self: Arc<Self>) {
        debug!("psp plugin receiver started");
        while self.running.load(Ordering::Acquire) {
            let mut guard = self.handle.lock();
            let Some(capture) = guard.as_mut() else {
                break;
            };
            match capture.next_packet() {
                Ok(packet) => {
                    let data = packet.data.to_vec();
                    drop(guard);
                    self.process(&data);
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(e) => {
                    drop(guard);
                    error!(error = %e, "capture read failed, stopping receiver");
                    self.running.store(false, Ordering::Release);
                }
            }
        }
        debug!("psp plugin receiver stopped");
    }

    fn process(&self, data: &[u8]) {
        let received = self.stats.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % STATISTICS_INTERVAL == 0 {
            debug!(
                packets = received,
                forwarded = self.stats.forwarded.load(Ordering::Relaxed),
                dropped = self.stats.dropped.load(Ordering::Relaxed),
                "capture statistics"
            );
        }

        let converter = self.converter.read().clone();
        let body = if converter.radiotap() {
            match parse_radiotap(data) {
                Some((_, _, offset)) if data.len() > offset => &data[offset..],
                _ => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        } else {
            data
        };

        if convert::is_beacon(body) {
            self.handler.process_beacon(body);
            return;
        }

        if !convert::is_data(body) {
            return;
        }

        // Primary gate: the plugin's fixed transmitter address
        let source = FrameControl::parse(body)
            .zip(Addresses::parse(body))
            .map(|(fc, addrs)| addrs.source(&fc));
        let Some(source) = source else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let filter = self.source_mac.load(Ordering::Relaxed);
        if filter != 0 && source.to_u64() != filter {
            trace!(source = %source, "source MAC filtered");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(session) = self.handler.session() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !convert::is_for_bssid(body, session.bssid) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match converter.convert_packet_to_8023(data) {
            Some(frame) => {
                if let Some(connector) = self.connector.read().as_ref().and_then(Weak::upgrade) {
                    if let Err(e) = connector.send_frame(&frame) {
                        warn!(error = %e, "forwarding frame failed");
                    } else {
                        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            None => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn inject(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut guard = self.handle.lock();
        let capture = guard.as_mut().ok_or(CaptureError::NotOpen)?;
        capture
            .sendpacket(frame)
            .map_err(|e| CaptureError::InjectionFailed(e.to_string()))?;
        self.stats.injected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl CaptureDevice for WirelessPspPluginDevice {
    fn open(&self, name: &str, ssid_filters: &[String]) -> Result<(), CaptureError> {
        if self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let capture = pcap::Capture::from_device(name)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .rfmon(true)
            .promisc(true)
            .immediate_mode(true)
            .snaplen(SNAPSHOT_LENGTH)
            .timeout(PSP_PLUGIN_READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let radiotap = capture.get_datalink() == pcap::Linktype::IEEE802_11_RADIOTAP;
        self.shared.converter.write().set_radiotap(radiotap);
        self.shared.handler.set_filters(ssid_filters.to_vec());

        *self.shared.handle.lock() = Some(capture);
        self.shared.connected.store(true, Ordering::Release);
        debug!(adapter = name, "psp plugin device opened");
        Ok(())
    }

    fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        *self.shared.handle.lock() = None;
        self.shared.handler.reset();
        self.shared.connected.store(false, Ordering::Release);
    }

    fn start_receiver(&self) -> Result<(), CaptureError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(CaptureError::NotOpen);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::ReceiverAlreadyRunning);
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("psp-plugin-rx".into())
            .spawn(move || shared.receive_loop())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                CaptureError::Fatal(e.to_string())
            })?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    fn set_connector(&self, connector: Weak<dyn Connector>) {
        *self.shared.connector.write() = Some(connector);
    }

    fn send_frame(&self, data: &[u8]) -> Result<(), CaptureError> {
        let session = self.shared.handler.session().ok_or(CaptureError::NoSession)?;
        let frame = self
            .shared
            .converter
            .read()
            .convert_packet_to_80211(data, session.bssid, session.frequency, session.max_rate)
            .ok_or(CaptureError::MalformedFrame)?;
        self.shared.inject(&frame)
    }

    fn locked_bssid(&self) -> u64 {
        self.shared.handler.locked_bssid()
    }

    fn set_source_mac_filter(&self, mac: u64) {
        self.shared.source_mac.store(mac, Ordering::Relaxed);
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            received: self.shared.stats.received.load(Ordering::Relaxed),
            forwarded: self.shared.stats.forwarded.load(Ordering::Relaxed),
            dropped: self.shared.stats.dropped.load(Ordering::Relaxed),
            malformed: self.shared.stats.malformed.load(Ordering::Relaxed),
            injected: self.shared.stats.injected.load(Ordering::Relaxed),
        }
    }

    fn as_connector(self: Arc<Self>) -> Arc<dyn Connector> {
        self
    }
}

impl Connector for WirelessPspPluginDevice {
    fn send_frame(&self, data: &[u8]) -> anyhow::Result<()> {
        CaptureDevice::send_frame(self, data)?;
        Ok(())
    }
}
