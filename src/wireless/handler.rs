//! Session lock-on for PSP/Vita ad-hoc networks
//!
//! Watches beacons for an SSID matching one of the configured prefixes and
//! locks onto its BSSID. Data frames are only bridged while a session is
//! locked; later beacons from the same BSSID refresh the radio parameters
//! (handhelds hop channels mid-session).

use parking_lot::RwLock;
use tracing::{debug, info};

use super::convert::{self, WifiInformation};

/// Stateful tracker of the locked ad-hoc session.
///
/// Written by the capture thread (beacons), read by both the capture thread
/// (BSSID gate) and the XLink receive thread (injection parameters).
#[derive(Debug, Default)]
pub struct Handler80211 {
    /// SSID prefix patterns, e.g. `PSP_` / `SCE_`
    filters: RwLock<Vec<String>>,
    /// Locked session, `None` while unlocked
    session: RwLock<Option<WifiInformation>>,
}

impl Handler80211 {
    pub fn new(filters: Vec<String>) -> Self {
        Self {
            filters: RwLock::new(filters),
            session: RwLock::new(None),
        }
    }

    /// Replace the SSID prefix filters.
    pub fn set_filters(&self, filters: Vec<String>) {
        *self.filters.write() = filters;
    }

    /// Feed a beacon (802.11 header onward). Locks onto the first beacon
    /// whose SSID matches a filter prefix; matching-BSSID beacons refresh
    /// the rate and frequency afterwards.
    pub fn process_beacon(&self, data: &[u8]) {
        let mut info = self
            .session
            .read()
            .clone()
            .unwrap_or_default();

        if !convert::fill_wifi_information(data, &mut info) {
            return;
        }

        let mut session = self.session.write();
        match session.as_mut() {
            None => {
                let filters = self.filters.read();
                if filters.iter().any(|f| info.ssid.starts_with(f.as_str())) {
                    info!(
                        ssid = %info.ssid,
                        bssid = %format_args!("{:012x}", info.bssid),
                        frequency = info.frequency,
                        "locked onto ad-hoc network"
                    );
                    *session = Some(info);
                }
            }
            Some(current) if current.bssid == info.bssid => {
                if current.frequency != info.frequency {
                    debug!(
                        frequency = info.frequency,
                        "session changed channel, following"
                    );
                }
                current.max_rate = info.max_rate;
                current.frequency = info.frequency;
            }
            // A different network; the first match keeps the lock
            Some(_) => {}
        }
    }

    /// True once a session is locked.
    pub fn is_locked(&self) -> bool {
        self.session.read().is_some()
    }

    /// BSSID of the locked session, 0 while unlocked.
    pub fn locked_bssid(&self) -> u64 {
        self.session.read().as_ref().map(|s| s.bssid).unwrap_or(0)
    }

    /// Snapshot of the locked session parameters.
    pub fn session(&self) -> Option<WifiInformation> {
        self.session.read().clone()
    }

    /// Drop the lock and the filters; the next matching beacon locks again.
    pub fn reset(&self) {
        *self.session.write() = None;
        self.filters.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireless::ieee80211::{element_id, BEACON_FIXED_PARAMS_LEN};

    fn beacon(bssid: [u8; 6], ssid: &str, channel: u8) -> Vec<u8> {
        let mut frame = vec![0x80, 0x00, 0x00, 0x00];
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

    #[test]
    fn test_locks_on_matching_prefix() {
        let handler = Handler80211::new(vec!["PSP_".into(), "SCE_".into()]);
        assert!(!handler.is_locked());

        handler.process_beacon(&beacon(
            [0x00, 0x16, 0xfe, 0xaa, 0xbb, 0xcc],
            "PSP_AULUS10266_L_MHP3rdCAMP___",
            6,
        ));

        assert!(handler.is_locked());
        assert_eq!(handler.locked_bssid(), 0xccbbaafe1600);
        let session = handler.session().unwrap();
        assert_eq!(session.frequency, 2437);
        assert_eq!(session.max_rate, 0x16);
    }

    #[test]
    fn test_ignores_non_matching_ssid() {
        let handler = Handler80211::new(vec!["PSP_".into()]);
        handler.process_beacon(&beacon([0x01; 6], "HomeNetwork", 1));
        assert!(!handler.is_locked());
        // Prefix must match at the start
        handler.process_beacon(&beacon([0x01; 6], "MY_PSP_GAME", 1));
        assert!(!handler.is_locked());
    }

    #[test]
    fn test_second_network_does_not_steal_lock() {
        let handler = Handler80211::new(vec!["PSP_".into()]);
        handler.process_beacon(&beacon([0x01; 6], "PSP_FIRST", 1));
        let first = handler.locked_bssid();

        handler.process_beacon(&beacon([0x02; 6], "PSP_SECOND", 11));
        assert_eq!(handler.locked_bssid(), first);
        assert_eq!(handler.session().unwrap().frequency, 2412);
    }

    #[test]
    fn test_matching_bssid_refreshes_radio_parameters() {
        let handler = Handler80211::new(vec!["PSP_".into()]);
        handler.process_beacon(&beacon([0x01; 6], "PSP_GAME", 1));
        assert_eq!(handler.session().unwrap().frequency, 2412);

        // Same session hops to channel 11
        handler.process_beacon(&beacon([0x01; 6], "PSP_GAME", 11));
        assert_eq!(handler.session().unwrap().frequency, 2462);
    }

    #[test]
    fn test_reset_unlocks_and_clears_filters() {
        let handler = Handler80211::new(vec!["PSP_".into()]);
        handler.process_beacon(&beacon([0x01; 6], "PSP_GAME", 1));
        assert!(handler.is_locked());

        handler.reset();
        assert!(!handler.is_locked());
        assert_eq!(handler.locked_bssid(), 0);

        // Filters were cleared with the lock
        handler.process_beacon(&beacon([0x01; 6], "PSP_GAME", 1));
        assert!(!handler.is_locked());
    }
}
