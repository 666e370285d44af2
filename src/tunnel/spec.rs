use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Supported tunnel technologies
///
/// Each kind is served by exactly one registered driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// OpenVPN client run as a supervised child process
    #[serde(rename = "openvpn")]
    OpenVpn,
    /// Cloudflare WARP, driven through the `warp-svc` daemon via `warp-cli`
    Warp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::OpenVpn => "openvpn",
            TunnelKind::Warp => "warp",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Technology-specific parameters handed to the driver on connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub config_path: Option<PathBuf>,
    pub auth_path: Option<PathBuf>,
}

/// Immutable description of one configured tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSpec {
    pub name: String,
    pub kind: TunnelKind,
    pub connect_params: ConnectParams,
    /// Lower is more preferred
    pub priority: i64,
    /// Position in the configuration file, breaks priority ties
    pub index: usize,
    pub probe_target: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub reconnect_delay: Duration,
    pub enabled: bool,
}

impl TunnelSpec {
    /// Total order used for every candidate scan
    pub fn order_key(&self) -> (i64, usize) {
        (self.priority, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_tags() {
        assert_eq!(serde_json::to_string(&TunnelKind::OpenVpn).unwrap(), "\"openvpn\"");
        assert_eq!(serde_json::to_string(&TunnelKind::Warp).unwrap(), "\"warp\"");
        let kind: TunnelKind = serde_json::from_str("\"warp\"").unwrap();
        assert_eq!(kind, TunnelKind::Warp);
        assert!(serde_json::from_str::<TunnelKind>("\"wireguard\"").is_err());
    }
}
