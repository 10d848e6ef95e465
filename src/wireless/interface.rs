//! Wireless adapter shim
//!
//! Uses nl80211 (via neli-wifi) for interface discovery and the adapter MAC
//! address, and the iw command for the ad-hoc network scan. Linux/BSD only;
//! the rest of the crate is platform independent.

use neli_wifi::Socket;

use super::ieee80211::MacAddr;

/// Wireless interface handle
#[derive(Debug, Clone)]
pub struct WifiInterface {
    /// Interface name (wlan0, etc.)
    pub name: String,
    /// Interface index
    pub ifindex: i32,
    /// Current frequency (MHz), if associated
    pub frequency: Option<u32>,
    /// MAC address
    pub mac_addr: Option<MacAddr>,
}

impl WifiInterface {
    /// List all wireless interfaces known to nl80211.
    pub fn list() -> Result<Vec<Self>, WirelessError> {
        let mut socket =
            Socket::connect().map_err(|e| WirelessError::SocketError(e.to_string()))?;

        let interfaces = socket
            .get_interfaces_info()
            .map_err(|e| WirelessError::Nl80211Error(e.to_string()))?;

        let mut result = Vec::new();
        for iface in interfaces {
            let name = iface
                .name
                .map(|n| String::from_utf8_lossy(&n).trim_end_matches('\0').to_string())
                .unwrap_or_default();

            let mac_addr = iface.mac.and_then(|m| MacAddr::from_slice(&m));

            result.push(Self {
                name,
                ifindex: iface.index.unwrap_or(0),
                frequency: iface.frequency,
                mac_addr,
            });
        }

        Ok(result)
    }

    /// Get a specific interface by name.
    pub fn get(name: &str) -> Result<Self, WirelessError> {
        Self::list()?
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| WirelessError::InterfaceNotFound(name.to_string()))
    }

    /// The adapter's MAC address as the 48-bit word used for comparisons.
    pub fn adapter_mac(&self) -> u64 {
        self.mac_addr.map(MacAddr::to_u64).unwrap_or(0)
    }

    /// Scan for visible ad-hoc (IBSS) networks and return their SSIDs.
    /// Requires root/CAP_NET_ADMIN.
    pub fn adhoc_networks(&self) -> Result<Vec<String>, WirelessError> {
        use std::process::Command;

        let output = Command::new("iw")
            .args(["dev", &self.name, "scan"])
            .output()
            .map_err(|e| WirelessError::SystemError(e.to_string()))?;

        if !output.status.success() {
            return Err(WirelessError::Nl80211Error(format!(
                "scan on {} failed",
                self.name
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_scan_output(&stdout))
    }
}

/// Pull the SSIDs of IBSS capability entries out of `iw dev <if> scan`
/// output. Each BSS block lists `capability:` before `SSID:`.
fn parse_scan_output(output: &str) -> Vec<String> {
    let mut networks = Vec::new();
    let mut in_ibss = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("BSS ") {
            in_ibss = false;
        } else if trimmed.starts_with("capability:") {
            in_ibss = trimmed.contains("IBSS");
        } else if let Some(ssid) = trimmed.strip_prefix("SSID: ") {
            if in_ibss && !ssid.is_empty() && !networks.contains(&ssid.to_string()) {
                networks.push(ssid.to_string());
            }
        }
    }

    networks
}

/// Wireless interface errors
#[derive(Debug)]
pub enum WirelessError {
    SocketError(String),
    Nl80211Error(String),
    InterfaceNotFound(String),
    SystemError(String),
}

impl std::fmt::Display for WirelessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WirelessError::SocketError(s) => write!(f, "Socket error: {}", s),
            WirelessError::Nl80211Error(s) => write!(f, "nl80211 error: {}", s),
            WirelessError::InterfaceNotFound(s) => write!(f, "Interface not found: {}", s),
            WirelessError::SystemError(s) => write!(f, "System error: {}", s),
        }
    }
}

impl std::error::Error for WirelessError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_output() {
        let output = "\
BSS 00:16:fe:aa:bb:cc(on wlan0)
	freq: 2437
	capability: IBSS Privacy ShortPreamble (0x0522)
	SSID: PSP_AULUS10266_L_MHP3rdCAMP___
BSS 11:22:33:44:55:66(on wlan0)
	freq: 2412
	capability: ESS Privacy (0x0411)
	SSID: HomeNetwork
BSS 22:33:44:55:66:77(on wlan0)
	freq: 2462
	capability: IBSS (0x0002)
	SSID: SCE_GAME
";
        let networks = parse_scan_output(output);
        assert_eq!(
            networks,
            vec![
                "PSP_AULUS10266_L_MHP3rdCAMP___".to_string(),
                "SCE_GAME".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_scan_output_deduplicates() {
        let output = "\
BSS aa(on wlan0)
	capability: IBSS (0x0002)
	SSID: PSP_GAME
BSS bb(on wlan0)
	capability: IBSS (0x0002)
	SSID: PSP_GAME
";
        assert_eq!(parse_scan_output(output), vec!["PSP_GAME".to_string()]);
    }
}
