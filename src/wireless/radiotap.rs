//! Radiotap header parsing and construction
//!
//! Radiotap is the de facto pseudo-header for 802.11 capture and injection.
//! The parse side walks the present-flag bitmap of captured frames; the build
//! side produces the minimal header (rate + channel) the bridge prepends to
//! injected frames.
//!
//! Reference: https://www.radiotap.org/

/// Radiotap present flags
pub mod flags {
    pub const TSFT: u32 = 1 << 0;
    pub const FLAGS: u32 = 1 << 1;
    pub const RATE: u32 = 1 << 2;
    pub const CHANNEL: u32 = 1 << 3;
    pub const FHSS: u32 = 1 << 4;
    pub const DBM_ANTSIGNAL: u32 = 1 << 5;
    pub const DBM_ANTNOISE: u32 = 1 << 6;
    pub const LOCK_QUALITY: u32 = 1 << 7;
    pub const TX_ATTENUATION: u32 = 1 << 8;
    pub const DB_TX_ATTENUATION: u32 = 1 << 9;
    pub const DBM_TX_POWER: u32 = 1 << 10;
    pub const ANTENNA: u32 = 1 << 11;
    pub const DB_ANTSIGNAL: u32 = 1 << 12;
    pub const DB_ANTNOISE: u32 = 1 << 13;
    pub const RX_FLAGS: u32 = 1 << 14;
    pub const EXT: u32 = 1 << 31;
}

/// Channel flags
pub mod channel_flags {
    pub const CCK: u16 = 0x0020;
    pub const OFDM: u16 = 0x0040;
    pub const SPECTRUM_2GHZ: u16 = 0x0080;
    pub const SPECTRUM_5GHZ: u16 = 0x0100;
}

/// Fixed part of the radiotap header
pub const RADIOTAP_FIXED_LEN: usize = 8;

/// Parsed radiotap header
#[derive(Debug, Clone, Default)]
pub struct RadiotapHeader {
    /// Header version (always 0)
    pub version: u8,
    /// Total header length including fields
    pub length: u16,
    /// Present flags indicating which fields follow
    pub present_flags: u32,
}

/// Extracted radiotap fields
#[derive(Debug, Clone, Default)]
pub struct RadiotapInfo {
    /// MAC timestamp in microseconds
    pub tsft: Option<u64>,
    /// Frame flags
    pub flags: Option<u8>,
    /// Data rate in 500 kbit/s units (e.g. 0x16 = 11 Mbit/s)
    pub rate: Option<u8>,
    /// Channel frequency in MHz
    pub channel_freq: Option<u16>,
    /// Channel flags
    pub channel_flags: Option<u16>,
    /// Signal strength in dBm
    pub signal_dbm: Option<i8>,
}

impl RadiotapInfo {
    pub fn is_2_4ghz(&self) -> bool {
        self.channel_freq
            .map(|f| (2400..=2500).contains(&f))
            .unwrap_or(false)
    }

    pub fn is_5ghz(&self) -> bool {
        self.channel_freq
            .map(|f| (5000..=6000).contains(&f))
            .unwrap_or(false)
    }
}

/// Parse a radiotap header. Returns the header, the extracted fields and the
/// offset of the 802.11 frame.
pub fn parse_radiotap(data: &[u8]) -> Option<(RadiotapHeader, RadiotapInfo, usize)> {
    if data.len() < RADIOTAP_FIXED_LEN {
        return None;
    }

    let version = data[0];
    if version != 0 {
        return None; // only version 0 exists
    }

    let length = u16::from_le_bytes([data[2], data[3]]);
    let present_flags = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if (length as usize) < RADIOTAP_FIXED_LEN || data.len() < length as usize {
        return None;
    }

    let header = RadiotapHeader {
        version,
        length,
        present_flags,
    };

    // Skip any extended present words before the field data
    let mut field_start = RADIOTAP_FIXED_LEN;
    let mut present = present_flags;
    while present & flags::EXT != 0 {
        if field_start + 4 > length as usize {
            return None;
        }
        present = u32::from_le_bytes([
            data[field_start],
            data[field_start + 1],
            data[field_start + 2],
            data[field_start + 3],
        ]);
        field_start += 4;
    }

    let info = parse_fields(&data[field_start..length as usize], present_flags);
    Some((header, info, length as usize))
}

/// Parse the variable fields following the present bitmap. Field order and
/// alignment follow the radiotap field registry.
fn parse_fields(data: &[u8], present: u32) -> RadiotapInfo {
    let mut info = RadiotapInfo::default();
    let mut pos = 0usize;

    let align = |pos: usize, to: usize| -> usize {
        if pos % to != 0 {
            pos + to - (pos % to)
        } else {
            pos
        }
    };

    if present & flags::TSFT != 0 {
        pos = align(pos, 8);
        if pos + 8 <= data.len() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[pos..pos + 8]);
            info.tsft = Some(u64::from_le_bytes(buf));
        }
        pos += 8;
    }

    if present & flags::FLAGS != 0 {
        if pos < data.len() {
            info.flags = Some(data[pos]);
        }
        pos += 1;
    }

    if present & flags::RATE != 0 {
        if pos < data.len() {
            info.rate = Some(data[pos]);
        }
        pos += 1;
    }

    if present & flags::CHANNEL != 0 {
        pos = align(pos, 2);
        if pos + 4 <= data.len() {
            info.channel_freq = Some(u16::from_le_bytes([data[pos], data[pos + 1]]));
            info.channel_flags = Some(u16::from_le_bytes([data[pos + 2], data[pos + 3]]));
        }
        pos += 4;
    }

    if present & flags::FHSS != 0 {
        pos = align(pos, 2);
        pos += 2;
    }

    if present & flags::DBM_ANTSIGNAL != 0 {
        if pos < data.len() {
            info.signal_dbm = Some(data[pos] as i8);
        }
    }

    info
}

/// Build the injection header: rate and channel present, nothing else.
/// The channel flags carry the CCK/2.4 GHz or OFDM/5 GHz spectrum bits
/// matching the frequency.
pub fn build_injection_header(frequency: u16, max_rate: u8) -> Vec<u8> {
    let chan_flags = if frequency >= 5000 {
        channel_flags::OFDM | channel_flags::SPECTRUM_5GHZ
    } else {
        channel_flags::CCK | channel_flags::SPECTRUM_2GHZ
    };

    // 8 fixed + 1 rate + 1 pad (channel is 2-aligned) + 2 freq + 2 flags
    let length: u16 = 14;
    let present = flags::RATE | flags::CHANNEL;

    let mut header = Vec::with_capacity(length as usize);
    header.push(0); // version
    header.push(0); // pad
    header.extend_from_slice(&length.to_le_bytes());
    header.extend_from_slice(&present.to_le_bytes());
    header.push(max_rate);
    header.push(0); // alignment
    header.extend_from_slice(&frequency.to_le_bytes());
    header.extend_from_slice(&chan_flags.to_le_bytes());

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        // version, pad, length=8, present=0
        let data = [0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        let (header, info, offset) = parse_radiotap(&data).unwrap();
        assert_eq!(header.version, 0);
        assert_eq!(header.length, 8);
        assert_eq!(offset, 8);
        assert!(info.rate.is_none());
    }

    #[test]
    fn test_parse_rejects_short_or_versioned() {
        assert!(parse_radiotap(&[0x00, 0x00, 0x08]).is_none());
        let bad_version = [0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(parse_radiotap(&bad_version).is_none());
        // claimed length longer than buffer
        let truncated = [0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(parse_radiotap(&truncated).is_none());
    }

    #[test]
    fn test_injection_header_round_trip() {
        let raw = build_injection_header(2437, 0x16);
        let (header, info, offset) = parse_radiotap(&raw).unwrap();
        assert_eq!(offset, raw.len());
        assert_eq!(header.present_flags, flags::RATE | flags::CHANNEL);
        assert_eq!(info.rate, Some(0x16));
        assert_eq!(info.channel_freq, Some(2437));
        assert_eq!(
            info.channel_flags,
            Some(channel_flags::CCK | channel_flags::SPECTRUM_2GHZ)
        );
        assert!(info.is_2_4ghz());
    }

    #[test]
    fn test_injection_header_5ghz_flags() {
        let raw = build_injection_header(5180, 0x6c);
        let (_, info, _) = parse_radiotap(&raw).unwrap();
        assert_eq!(
            info.channel_flags,
            Some(channel_flags::OFDM | channel_flags::SPECTRUM_5GHZ)
        );
        assert!(info.is_5ghz());
    }

    #[test]
    fn test_parse_rate_and_channel_after_tsft() {
        let mut data = vec![0u8; 24];
        data[0] = 0;
        data[2] = 24; // length
        let present = flags::TSFT | flags::RATE | flags::CHANNEL;
        data[4..8].copy_from_slice(&present.to_le_bytes());
        data[8..16].copy_from_slice(&123u64.to_le_bytes());
        data[16] = 0x16; // rate
        // channel aligns to offset 18 relative to field start 8 -> abs 18
        data[18..20].copy_from_slice(&2412u16.to_le_bytes());
        data[20..22].copy_from_slice(&0x00a0u16.to_le_bytes());

        let (_, info, offset) = parse_radiotap(&data).unwrap();
        assert_eq!(offset, 24);
        assert_eq!(info.tsft, Some(123));
        assert_eq!(info.rate, Some(0x16));
        assert_eq!(info.channel_freq, Some(2412));
    }
}
