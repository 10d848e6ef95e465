//! Monitor-mode capture device
//!
//! Reads radiotap-wrapped 802.11 frames from an adapter in monitor mode,
//! feeds beacons to the session handler and bridges matching data frames to
//! the connector as Ethernet frames. Downstream frames from the connector
//! are converted back to 802.11 and injected through the same pcap handle.

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
    CaptureDevice, CaptureError, Connector, DeviceStats, MONITOR_READ_TIMEOUT_MS, SNAPSHOT_LENGTH,
};

/// Generic ad-hoc monitor-mode device.
pub struct MonitorDevice {
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
    acknowledge: AtomicBool,
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

impl MonitorDevice {
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
                acknowledge: AtomicBool::new(false),
                stats: Counters::default(),
            }),
            receiver: Mutex::new(None),
        }
    }

    /// Duration value for synthesized ACKs (chipset knob).
    pub fn set_ack_duration(&self, duration: u16) {
        self.shared.converter.write().set_ack_duration(duration);
    }

    /// Inject an 802.3 frame using explicit session parameters instead of
    /// the locked session's.
    pub fn send_frame_with(
        &self,
        data: &[u8],
        info: &crate::wireless::WifiInformation,
    ) -> Result<(), CaptureError> {
        let frame = self
            .shared
            .converter
            .read()
            .convert_packet_to_80211(data, info.bssid, info.frequency, info.max_rate)
            .ok_or(CaptureError::MalformedFrame)?;
        self.shared.inject(&frame)
    }
}

impl Default for MonitorDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn receive_loop(self: Arc<Self>) {
        debug!("monitor receiver started");
        while self.running.load(Ordering::Acquire) {
            let mut guard = self.handle.lock();
            let Some(capture) = guard.as_mut() else {
                break;
            };
            match capture.next_packet() {
                Ok(packet) => {
                    let data = packet.data.to_vec();
                    drop(guard);
                    if let Some(ack) = self.process(&data) {
                        if let Err(e) = self.inject(&ack) {
                            warn!(error = %e, "acknowledgement injection failed");
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => {
                    // Release the handle so senders get a turn
                }
                Err(e) => {
                    drop(guard);
                    error!(error = %e, "capture read failed, stopping receiver");
                    self.running.store(false, Ordering::Release);
                }
            }
        }
        debug!("monitor receiver stopped");
    }

    /// One captured frame: strip radiotap, track beacons, bridge data.
    /// Returns the acknowledgement to inject when the frame was accepted
    /// and acknowledgements are enabled.
    fn process(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let converter = self.converter.read().clone();
        let body = if converter.radiotap() {
            match parse_radiotap(data) {
                Some((_, _, offset)) if data.len() > offset => &data[offset..],
                _ => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        } else {
            data
        };

        if convert::is_beacon(body) {
            self.handler.process_beacon(body);
            return None;
        }

        if !convert::is_data(body) {
            return None;
        }

        let Some(session) = self.handler.session() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if !convert::is_for_bssid(body, session.bssid) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let source = FrameControl::parse(body)
            .zip(Addresses::parse(body))
            .map(|(fc, addrs)| addrs.source(&fc));
        let Some(source) = source else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let filter = self.source_mac.load(Ordering::Relaxed);
        if filter != 0 && source.to_u64() != filter {
            trace!(source = %source, "source MAC filtered");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
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
                return None;
            }
        }

        // Keep the handheld's link layer happy
        self.acknowledge
            .load(Ordering::Relaxed)
            .then(|| converter.build_acknowledgement(source, session.frequency, session.max_rate))
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

impl CaptureDevice for MonitorDevice {
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
            .timeout(MONITOR_READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let radiotap = capture.get_datalink() == pcap::Linktype::IEEE802_11_RADIOTAP;
        if !radiotap {
            debug!(datalink = ?capture.get_datalink(), "capture without radiotap framing");
        }
        self.shared.converter.write().set_radiotap(radiotap);
        self.shared.handler.set_filters(ssid_filters.to_vec());

        *self.shared.handle.lock() = Some(capture);
        self.shared.connected.store(true, Ordering::Release);
        debug!(adapter = name, "monitor device opened");
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
            .name("monitor-rx".into())
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

    fn set_acknowledge(&self, acknowledge: bool) {
        self.shared.acknowledge.store(acknowledge, Ordering::Relaxed);
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

impl Connector for MonitorDevice {
    fn send_frame(&self, data: &[u8]) -> anyhow::Result<()> {
        CaptureDevice::send_frame(self, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireless::ieee80211::{element_id, LlcSnapHeader, BEACON_FIXED_PARAMS_LEN};
    use crate::wireless::radiotap::build_injection_header;

    struct CollectingSink {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Connector for CollectingSink {
        fn send_frame(&self, data: &[u8]) -> anyhow::Result<()> {
            self.frames.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn wrapped_beacon(bssid: [u8; 6], ssid: &str, channel: u8) -> Vec<u8> {
        let mut frame = build_injection_header(2412, 0x16);
        frame.extend_from_slice(&[0x80, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&bssid);
        frame.extend_from_slice(&bssid);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0u8; BEACON_FIXED_PARAMS_LEN]);
        frame.push(element_id::SSID);
        frame.push(ssid.len() as u8);
        frame.extend_from_slice(ssid.as_bytes());
        frame.extend_from_slice(&[element_id::SUPPORTED_RATES, 1, 0x96]);
        frame.extend_from_slice(&[element_id::DS_PARAMETER, 1, channel]);
        frame
    }

    fn wrapped_data(bssid: [u8; 6], source: [u8; 6], payload: &[u8]) -> Vec<u8> {
        let mut frame = build_injection_header(2412, 0x16);
        frame.extend_from_slice(&[0x08, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&[0x0a; 6]); // dest
        frame.extend_from_slice(&source);
        frame.extend_from_slice(&bssid);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&LlcSnapHeader::encode(0x0800));
        frame.extend_from_slice(payload);
        frame
    }

    fn device_with_sink(filters: &[&str]) -> (MonitorDevice, Arc<CollectingSink>) {
        let device = MonitorDevice::new();
        device
            .shared
            .handler
            .set_filters(filters.iter().map(|s| s.to_string()).collect());
        let sink = Arc::new(CollectingSink {
            frames: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Connector> =
            Arc::downgrade(&(sink.clone() as Arc<dyn Connector>));
        device.set_connector(weak);
        (device, sink)
    }

    #[test]
    fn test_no_frames_forwarded_while_unlocked() {
        let (device, sink) = device_with_sink(&["PSP_"]);
        for _ in 0..5 {
            let _ = device
                .shared
                .process(&wrapped_data([0x01; 6], [0x02; 6], b"payload"));
        }
        assert!(sink.frames.lock().is_empty());
        assert_eq!(device.stats().dropped, 5);
    }

    #[test]
    fn test_lock_then_forward_and_filter() {
        let (device, sink) = device_with_sink(&["PSP_"]);
        let bssid = [0x00, 0x16, 0xfe, 0xaa, 0xbb, 0xcc];

        let _ = device.shared.process(&wrapped_beacon(bssid, "PSP_GAME", 6));
        assert_eq!(device.locked_bssid(), 0xccbbaafe1600);

        // Matching BSSID forwards
        let _ = device.shared.process(&wrapped_data(bssid, [0x02; 6], b"hello"));
        assert_eq!(sink.frames.lock().len(), 1);

        // Foreign BSSID is dropped
        let _ = device.shared.process(&wrapped_data([0x09; 6], [0x02; 6], b"x"));
        assert_eq!(sink.frames.lock().len(), 1);

        let stats = device.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_source_mac_filter() {
        let (device, sink) = device_with_sink(&["PSP_"]);
        let bssid = [0x01; 6];
        let _ = device.shared.process(&wrapped_beacon(bssid, "PSP_GAME", 1));

        let allowed = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
        device.set_source_mac_filter(convert::mac_to_int("66:77:88:99:aa:bb"));

        let _ = device.shared.process(&wrapped_data(bssid, [0x02; 6], b"no"));
        assert!(sink.frames.lock().is_empty());

        let _ = device.shared.process(&wrapped_data(bssid, allowed, b"yes"));
        assert_eq!(sink.frames.lock().len(), 1);
    }

    #[test]
    fn test_forwarded_frame_is_ethernet() {
        let (device, sink) = device_with_sink(&["PSP_"]);
        let bssid = [0x01; 6];
        let _ = device.shared.process(&wrapped_beacon(bssid, "PSP_GAME", 1));
        let _ = device
            .shared
            .process(&wrapped_data(bssid, [0x02; 6], &[0xde, 0xad]));

        let frames = sink.frames.lock();
        let eth = &frames[0];
        assert_eq!(&eth[0..6], &[0x0a; 6]);
        assert_eq!(&eth[6..12], &[0x02; 6]);
        assert_eq!(u16::from_be_bytes([eth[12], eth[13]]), 0x0800);
        assert_eq!(&eth[14..], &[0xde, 0xad]);
    }

    #[test]
    fn test_send_frame_requires_lock() {
        let device = MonitorDevice::new();
        let eth = [0u8; 14];
        assert!(matches!(
            CaptureDevice::send_frame(&device, &eth),
            Err(CaptureError::NoSession)
        ));

        // With explicit session parameters the lock is not consulted; only
        // the closed handle stops the injection here
        let mut eth = vec![0u8; 14];
        eth[12] = 0x08; // EtherType 0x0800
        let info = crate::wireless::WifiInformation {
            bssid: 0xccbbaafe1600,
            ..Default::default()
        };
        assert!(matches!(
            device.send_frame_with(&eth, &info),
            Err(CaptureError::NotOpen)
        ));
    }

    #[test]
    fn test_malformed_frames_counted_not_fatal() {
        let (device, _) = device_with_sink(&["PSP_"]);
        let _ = device.shared.process(&[0x00, 0x00, 0x03]);
        let _ = device.shared.process(&[]);
        assert_eq!(device.stats().malformed, 2);
    }

    #[test]
    fn test_close_is_repeat_safe() {
        let device = MonitorDevice::new();
        device.close();
        device.close();
        assert!(matches!(
            device.start_receiver(),
            Err(CaptureError::NotOpen)
        ));
    }

    #[test]
    fn test_accepted_frame_yields_one_ack_for_transmitter() {
        let (device, _sink) = device_with_sink(&["PSP_"]);
        device.set_acknowledge(true);
        let bssid = [0x01; 6];
        let source = [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];

        assert!(device
            .shared
            .process(&wrapped_beacon(bssid, "PSP_GAME", 6))
            .is_none());

        let ack = device
            .shared
            .process(&wrapped_data(bssid, source, b"payload"))
            .expect("accepted frame must produce an acknowledgement");

        let (_, info, offset) = parse_radiotap(&ack).unwrap();
        assert_eq!(info.channel_freq, Some(2437));
        let body = &ack[offset..];
        assert_eq!(body[0], 0xd4);
        assert_eq!(&body[4..10], &source);

        // Rejected frames never produce one
        assert!(device
            .shared
            .process(&wrapped_data([0x09; 6], source, b"x"))
            .is_none());
    }

    #[test]
    fn test_no_ack_when_disabled() {
        let (device, _sink) = device_with_sink(&["PSP_"]);
        let bssid = [0x01; 6];
        let _ = device.shared.process(&wrapped_beacon(bssid, "PSP_GAME", 6));
        assert!(device
            .shared
            .process(&wrapped_data(bssid, [0x02; 6], b"payload"))
            .is_none());
    }
}
