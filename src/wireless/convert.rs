//! 802.11 <-> 802.3 frame conversion
//!
//! Converts monitor-mode captures (radiotap + 802.11 + LLC/SNAP) into the
//! Ethernet frames XLink Kai expects, and back. Also extracts the session
//! parameters (BSSID, SSID, rate, channel) from ad-hoc beacons.

use tracing::trace;

use super::ieee80211::{
    self, element_id, parse_ies, Addresses, FrameControl, FrameType, LlcSnapHeader, MacAddr,
    BEACON_FIXED_PARAMS_LEN, LLC_SNAP_LEN, MAC_HEADER_LEN,
};
use super::radiotap::{build_injection_header, parse_radiotap};

/// Ethernet (802.3) header length
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Default rate until a beacon provides one: 11 Mbit/s in 500 kbit/s units,
/// the PSP's 802.11b top rate.
pub const DEFAULT_MAX_RATE: u8 = 0x16;

/// Default channel 1 frequency until a beacon provides one
pub const DEFAULT_FREQUENCY: u16 = 2412;

/// Radio parameters of the ad-hoc session, filled from beacons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiInformation {
    /// BSSID packed into the low 48 bits (see [`MacAddr::to_u64`])
    pub bssid: u64,
    /// SSID, up to 32 bytes
    pub ssid: String,
    /// Highest supported rate in 500 kbit/s units
    pub max_rate: u8,
    /// Channel frequency in MHz
    pub frequency: u16,
}

impl Default for WifiInformation {
    fn default() -> Self {
        Self {
            bssid: 0,
            ssid: String::new(),
            max_rate: DEFAULT_MAX_RATE,
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

/// True if the frame is a management/beacon frame. `data` must start at the
/// 802.11 header.
pub fn is_beacon(data: &[u8]) -> bool {
    FrameControl::parse(data)
        .map(|fc| fc.frame_type == FrameType::Management && fc.subtype == ieee80211::subtype::BEACON)
        .unwrap_or(false)
}

/// True if the frame is a plain data or QoS data frame. Null-function
/// frames are excluded; see [`is_null_func`].
pub fn is_data(data: &[u8]) -> bool {
    FrameControl::parse(data)
        .map(|fc| {
            fc.frame_type == FrameType::Data
                && (fc.subtype == ieee80211::subtype::DATA
                    || fc.subtype == ieee80211::subtype::QOS_DATA)
        })
        .unwrap_or(false)
}

/// True if the frame is a QoS data frame (subtype bit 3 under type data).
/// Consumers must skip the 2-byte QoS control field before the LLC/SNAP.
pub fn is_qos_data(data: &[u8]) -> bool {
    FrameControl::parse(data).map(|fc| fc.is_qos()).unwrap_or(false)
}

/// True if the frame is a (QoS) null-function frame.
pub fn is_null_func(data: &[u8]) -> bool {
    FrameControl::parse(data)
        .map(|fc| {
            fc.frame_type == FrameType::Data
                && (fc.subtype == ieee80211::subtype::NULL_FUNC
                    || fc.subtype == ieee80211::subtype::QOS_NULL_FUNC)
        })
        .unwrap_or(false)
}

/// BSSID from the address 3 field, packed little-endian. 0 if the header is
/// too short.
pub fn get_bssid(data: &[u8]) -> u64 {
    MacAddr::from_slice(data.get(16..22).unwrap_or_default())
        .map(MacAddr::to_u64)
        .unwrap_or(0)
}

/// True if the frame's BSSID field matches `bssid`.
pub fn is_for_bssid(data: &[u8], bssid: u64) -> bool {
    get_bssid(data) == bssid
}

/// SSID from the tagged parameters of a beacon. Empty if the tag is missing
/// or zero-length.
pub fn get_beacon_ssid(data: &[u8]) -> String {
    let tagged_start = MAC_HEADER_LEN + BEACON_FIXED_PARAMS_LEN;
    let Some(tagged) = data.get(tagged_start..) else {
        return String::new();
    };

    parse_ies(tagged)
        .find(|ie| ie.id == element_id::SSID)
        .map(|ie| String::from_utf8_lossy(ie.data).into_owned())
        .unwrap_or_default()
}

/// Extract BSSID, SSID, max rate and frequency from a beacon. Returns false
/// if the beacon is malformed. Rate and frequency keep their previous values
/// when the corresponding tag is absent.
pub fn fill_wifi_information(data: &[u8], info: &mut WifiInformation) -> bool {
    if !is_beacon(data) {
        return false;
    }

    let Some(addrs) = Addresses::parse(data) else {
        return false;
    };

    let tagged_start = MAC_HEADER_LEN + BEACON_FIXED_PARAMS_LEN;
    let Some(tagged) = data.get(tagged_start..) else {
        return false;
    };

    info.bssid = addrs.addr3.to_u64();

    let mut found_ssid = false;
    for ie in parse_ies(tagged) {
        match ie.id {
            element_id::SSID => {
                info.ssid = String::from_utf8_lossy(ie.data).into_owned();
                found_ssid = true;
            }
            element_id::SUPPORTED_RATES => {
                // Highest rate is the last entry, basic-rate bit masked off
                if let Some(rate) = ie.data.last() {
                    info.max_rate = rate & 0x7f;
                }
            }
            element_id::DS_PARAMETER => {
                if let Some(&channel) = ie.data.first() {
                    let freq = channel_to_frequency(channel as i32);
                    if freq > 0 {
                        info.frequency = freq as u16;
                    }
                }
            }
            _ => {}
        }
    }

    found_ssid
}

/// Convert a channel number to its center frequency in MHz. Returns -1 for
/// channels outside the 2.4 GHz and 5 GHz bands.
pub fn channel_to_frequency(channel: i32) -> i32 {
    match channel {
        1..=13 => 2407 + 5 * channel,
        14 => 2484,
        36..=165 => 5000 + 5 * channel,
        _ => -1,
    }
}

/// Parse `xx:xx:xx:xx:xx:xx` into the 48-bit little-endian word used for MAC
/// comparison. Returns 0 (the "no filter" value) for invalid input.
pub fn mac_to_int(mac: &str) -> u64 {
    mac.parse::<MacAddr>().map(MacAddr::to_u64).unwrap_or(0)
}

/// Converter between monitor-mode and Ethernet framing.
#[derive(Debug, Clone)]
pub struct PacketConverter {
    /// Whether captured frames carry (and injected frames receive) a
    /// radiotap header
    radiotap: bool,
    /// Duration value written into synthesized ACK frames
    ack_duration: u16,
}

impl PacketConverter {
    pub fn new(radiotap: bool) -> Self {
        Self {
            radiotap,
            ack_duration: 0,
        }
    }

    pub fn set_radiotap(&mut self, radiotap: bool) {
        self.radiotap = radiotap;
    }

    pub fn radiotap(&self) -> bool {
        self.radiotap
    }

    /// Some chipsets refuse ACKs with a zero NAV; this knob sets the
    /// duration field of synthesized ACKs.
    pub fn set_ack_duration(&mut self, duration: u16) {
        self.ack_duration = duration;
    }

    /// Strip radiotap (when enabled) and the 802.11 + LLC/SNAP headers from
    /// a data frame and rebuild it as an Ethernet frame. Returns `None` on
    /// any structural mismatch.
    pub fn convert_packet_to_8023(&self, data: &[u8]) -> Option<Vec<u8>> {
        let body = if self.radiotap {
            let (_, _, offset) = parse_radiotap(data)?;
            data.get(offset..)?
        } else {
            data
        };

        let fc = FrameControl::parse(body)?;
        if fc.frame_type != FrameType::Data
            || (fc.subtype != ieee80211::subtype::DATA
                && fc.subtype != ieee80211::subtype::QOS_DATA)
        {
            trace!(subtype = fc.subtype, "not a convertible data frame");
            return None;
        }
        if fc.protected {
            trace!("dropping protected data frame");
            return None;
        }

        let addrs = Addresses::parse(body)?;
        let header_len = fc.header_len();
        let llc = LlcSnapHeader::parse(body.get(header_len..)?)?;
        let payload = body.get(header_len + LLC_SNAP_LEN..)?;

        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
        frame.extend_from_slice(addrs.destination(&fc).as_bytes());
        frame.extend_from_slice(addrs.source(&fc).as_bytes());
        frame.extend_from_slice(&llc.ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        Some(frame)
    }

    /// Wrap an Ethernet frame into radiotap + 802.11 + LLC/SNAP for
    /// injection into the ad-hoc session identified by `bssid`.
    pub fn convert_packet_to_80211(
        &self,
        data: &[u8],
        bssid: u64,
        frequency: u16,
        max_rate: u8,
    ) -> Option<Vec<u8>> {
        if data.len() < ETHERNET_HEADER_LEN {
            return None;
        }

        let dest = MacAddr::from_slice(&data[0..6])?;
        let source = MacAddr::from_slice(&data[6..12])?;
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        if ethertype == 0 {
            return None;
        }
        let payload = &data[ETHERNET_HEADER_LEN..];

        let radiotap = if self.radiotap {
            build_injection_header(frequency, max_rate)
        } else {
            Vec::new()
        };

        let mut frame =
            Vec::with_capacity(radiotap.len() + MAC_HEADER_LEN + LLC_SNAP_LEN + payload.len());
        frame.extend_from_slice(&radiotap);

        // Data frame, ToDS/FromDS clear (IBSS)
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(&[0x00, 0x00]); // duration
        frame.extend_from_slice(dest.as_bytes());
        frame.extend_from_slice(source.as_bytes());
        frame.extend_from_slice(MacAddr::from_u64(bssid).as_bytes());
        frame.extend_from_slice(&[0x00, 0x00]); // sequence control

        frame.extend_from_slice(&LlcSnapHeader::encode(ethertype));
        frame.extend_from_slice(payload);
        Some(frame)
    }

    /// Synthesize the control/ACK frame answering a data frame transmitted
    /// by `receiver`, radiotap included when enabled.
    pub fn build_acknowledgement(
        &self,
        receiver: MacAddr,
        frequency: u16,
        max_rate: u8,
    ) -> Vec<u8> {
        let radiotap = if self.radiotap {
            build_injection_header(frequency, max_rate)
        } else {
            Vec::new()
        };

        let mut frame = Vec::with_capacity(radiotap.len() + 10);
        frame.extend_from_slice(&radiotap);
        frame.extend_from_slice(&[0xd4, 0x00]); // control / ACK
        frame.extend_from_slice(&self.ack_duration.to_le_bytes());
        frame.extend_from_slice(receiver.as_bytes());
        frame
    }
}

impl Default for PacketConverter {
    fn default() -> Self {
        Self::new(true)
    }
}
