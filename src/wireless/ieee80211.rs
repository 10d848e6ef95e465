//! 802.11 MAC layer primitives
//!
//! Frame control parsing, MAC addresses, information elements and the
//! LLC/SNAP shim. Only the pieces the ad-hoc bridge needs: beacons and
//! (QoS-)data frames in IBSS mode.

use std::fmt;
use std::str::FromStr;

/// 802.11 MAC header length without QoS control
pub const MAC_HEADER_LEN: usize = 24;

/// QoS control field length
pub const QOS_CONTROL_LEN: usize = 2;

/// LLC/SNAP header length
pub const LLC_SNAP_LEN: usize = 8;

/// Fixed parameters (timestamp + interval + capability) preceding the
/// tagged parameters in a beacon body
pub const BEACON_FIXED_PARAMS_LEN: usize = 12;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    pub const ZERO: MacAddr = MacAddr([0, 0, 0, 0, 0, 0]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&data[..6]);
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Pack into the low 48 bits of a u64, first wire byte in the lowest
    /// byte. This is the ordering used everywhere for BSSID comparison and
    /// the source-MAC filter.
    pub fn to_u64(self) -> u64 {
        let mut val = 0u64;
        for (i, b) in self.0.iter().enumerate() {
            val |= (*b as u64) << (8 * i);
        }
        val
    }

    /// Inverse of [`MacAddr::to_u64`].
    pub fn from_u64(val: u64) -> Self {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((val >> (8 * i)) & 0xff) as u8;
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Parses `xx:xx:xx:xx:xx:xx` (case-insensitive, `:` or `-` separated).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;

        for part in s.split(|c| c == ':' || c == '-') {
            if count == 6 {
                return Err(MacParseError(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(MacParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// Invalid MAC address string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacParseError(pub String);

impl fmt::Display for MacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for MacParseError {}

/// Frame type (2 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Management = 0,
    Control = 1,
    Data = 2,
    Extension = 3,
}

impl From<u8> for FrameType {
    fn from(val: u8) -> Self {
        match val & 0x03 {
            0 => FrameType::Management,
            1 => FrameType::Control,
            2 => FrameType::Data,
            _ => FrameType::Extension,
        }
    }
}

/// Frame subtype constants used by the bridge
pub mod subtype {
    /// Management: beacon
    pub const BEACON: u8 = 0x08;
    /// Control: acknowledgement
    pub const ACK: u8 = 0x0d;
    /// Data: plain data
    pub const DATA: u8 = 0x00;
    /// Data: null function (no payload)
    pub const NULL_FUNC: u8 = 0x04;
    /// Data: QoS data
    pub const QOS_DATA: u8 = 0x08;
    /// Data: QoS null function
    pub const QOS_NULL_FUNC: u8 = 0x0c;
}

/// Frame control field (2 bytes)
#[derive(Debug, Clone, Copy)]
pub struct FrameControl {
    /// Protocol version (should be 0)
    pub protocol_version: u8,
    /// Frame type
    pub frame_type: FrameType,
    /// Raw 4-bit subtype
    pub subtype: u8,
    /// To DS flag
    pub to_ds: bool,
    /// From DS flag
    pub from_ds: bool,
    /// Retry flag
    pub retry: bool,
    /// Protected frame flag (WEP/WPA)
    pub protected: bool,
}

impl FrameControl {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let fc0 = data[0];
        let fc1 = data[1];

        Some(Self {
            protocol_version: fc0 & 0x03,
            frame_type: FrameType::from((fc0 >> 2) & 0x03),
            subtype: (fc0 >> 4) & 0x0f,
            to_ds: fc1 & 0x01 != 0,
            from_ds: fc1 & 0x02 != 0,
            retry: fc1 & 0x08 != 0,
            protected: fc1 & 0x40 != 0,
        })
    }

    /// QoS data subtypes have bit 3 of the subtype set.
    pub fn is_qos(&self) -> bool {
        self.frame_type == FrameType::Data && self.subtype & 0x08 != 0
    }

    /// MAC header length for this frame, including the QoS control field
    /// when present.
    pub fn header_len(&self) -> usize {
        if self.is_qos() {
            MAC_HEADER_LEN + QOS_CONTROL_LEN
        } else {
            MAC_HEADER_LEN
        }
    }
}

/// The three addresses of a (non-WDS) 802.11 MAC header.
#[derive(Debug, Clone, Copy)]
pub struct Addresses {
    /// Address 1 (receiver)
    pub addr1: MacAddr,
    /// Address 2 (transmitter)
    pub addr2: MacAddr,
    /// Address 3 (BSSID in IBSS mode)
    pub addr3: MacAddr,
}

impl Addresses {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MAC_HEADER_LEN {
            return None;
        }
        Some(Self {
            addr1: MacAddr::from_slice(&data[4..])?,
            addr2: MacAddr::from_slice(&data[10..])?,
            addr3: MacAddr::from_slice(&data[16..])?,
        })
    }

    /// BSSID per the ToDS/FromDS bits.
    pub fn bssid(&self, fc: &FrameControl) -> MacAddr {
        match (fc.to_ds, fc.from_ds) {
            (false, false) => self.addr3, // IBSS
            (false, true) => self.addr2,  // from AP
            (true, _) => self.addr1,
        }
    }

    /// Source address per the ToDS/FromDS bits. For an IBSS frame (both
    /// bits clear) the transmitter in address 2 is the source.
    pub fn source(&self, fc: &FrameControl) -> MacAddr {
        match (fc.to_ds, fc.from_ds) {
            (false, true) => self.addr3,
            _ => self.addr2,
        }
    }

    /// Destination address per the ToDS/FromDS bits.
    pub fn destination(&self, fc: &FrameControl) -> MacAddr {
        match (fc.to_ds, fc.from_ds) {
            (true, false) | (true, true) => self.addr3,
            _ => self.addr1,
        }
    }
}

/// Information element IDs used by the bridge
pub mod element_id {
    pub const SSID: u8 = 0;
    pub const SUPPORTED_RATES: u8 = 1;
    pub const DS_PARAMETER: u8 = 3;
}

/// Parsed information element, borrowing from the frame body.
#[derive(Debug, Clone, Copy)]
pub struct InformationElement<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// Walk the tagged parameters of a management frame body.
pub fn parse_ies(data: &[u8]) -> impl Iterator<Item = InformationElement<'_>> + '_ {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos + 2 > data.len() {
            return None;
        }
        let id = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return None;
        }
        let ie = InformationElement {
            id,
            data: &data[pos..pos + len],
        };
        pos += len;
        Some(ie)
    })
}

/// LLC/SNAP header carrying an EtherType inside an 802.11 data frame
#[derive(Debug, Clone, Copy)]
pub struct LlcSnapHeader {
    /// OUI (00:00:00 for encapsulated Ethernet)
    pub oui: [u8; 3],
    /// EtherType
    pub ethertype: u16,
}

impl LlcSnapHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < LLC_SNAP_LEN {
            return None;
        }

        // SNAP: dsap/ssap 0xaa, control 0x03
        if data[0] != 0xaa || data[1] != 0xaa || data[2] != 0x03 {
            return None;
        }

        let mut oui = [0u8; 3];
        oui.copy_from_slice(&data[3..6]);

        Some(LlcSnapHeader {
            oui,
            ethertype: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn encode(ethertype: u16) -> [u8; LLC_SNAP_LEN] {
        let et = ethertype.to_be_bytes();
        [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00, et[0], et[1]]
    }
}
