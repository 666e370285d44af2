//! Configuration management for vpn-failover
//!
//! The configuration file is JSON (`/etc/vpn-failover/config.json`) unless
//! its name ends in `.toml`. It lists the tunnels in declaration order;
//! declaration order breaks priority ties.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FailoverError, FailoverResult};
use crate::tunnel::{ConnectParams, TunnelKind, TunnelSpec};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpn-failover/config.json";
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/vpn-failover.sock";
pub const DEFAULT_HEALTH_CHECK_URL: &str = "https://httpbin.org/ip";

/// Main vpn-failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Container network whose egress follows the active tunnel
    #[serde(default = "default_docker_network")]
    pub docker_network: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Unix socket serving status and shutdown requests
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// Monitor tick (seconds) while no tunnel is active
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval: u64,
    /// Bound (seconds) on each shutdown step
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    /// Executable run as `<hook> <tunnel> <docker_network>` after each activation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_hook: Option<PathBuf>,
    #[serde(default)]
    pub drivers: DriverSettings,
    /// Tunnels in declaration order
    pub vpns: Vec<TunnelConfig>,
}

/// One tunnel entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub vpn_type: TunnelKind,
    /// Required for openvpn entries
    #[serde(default)]
    pub config_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_path: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_health_check_url")]
    pub health_check_url: String,
    /// Seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    /// Seconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Where the drivers find their binaries and put their files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "default_openvpn_binary")]
    pub openvpn_binary: String,
    #[serde(default = "default_warp_cli_binary")]
    pub warp_cli_binary: String,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_docker_network() -> String {
    "vpn-network".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_idle_check_interval() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_priority() -> i64 {
    1
}

fn default_health_check_url() -> String {
    DEFAULT_HEALTH_CHECK_URL.to_string()
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_max_failures() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

fn default_openvpn_binary() -> String {
    "openvpn".to_string()
}

fn default_warp_cli_binary() -> String {
    "warp-cli".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/var/run")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log")
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            openvpn_binary: default_openvpn_binary(),
            warp_cli_binary: default_warp_cli_binary(),
            run_dir: default_run_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl TunnelConfig {
    /// Entry with every optional field at its default
    pub fn new(name: &str, vpn_type: TunnelKind, config_path: &str) -> Self {
        Self {
            name: name.to_string(),
            vpn_type,
            config_path: config_path.to_string(),
            auth_path: None,
            priority: default_priority(),
            health_check_url: default_health_check_url(),
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            max_failures: default_max_failures(),
            reconnect_delay: default_reconnect_delay(),
            enabled: default_enabled(),
        }
    }

    fn validate(&self) -> FailoverResult<()> {
        let invalid = |msg: &str| FailoverError::Config(format!("VPN '{}': {}", self.name, msg));

        if self.max_failures == 0 {
            return Err(invalid("max_failures must be at least 1"));
        }
        if self.health_check_interval == 0 {
            return Err(invalid("health_check_interval must be positive"));
        }
        if self.health_check_timeout == 0 {
            return Err(invalid("health_check_timeout must be positive"));
        }
        reqwest::Url::parse(&self.health_check_url)
            .map_err(|e| invalid(&format!("invalid health_check_url '{}': {}", self.health_check_url, e)))?;
        if self.vpn_type == TunnelKind::OpenVpn && self.config_path.trim().is_empty() {
            return Err(invalid("openvpn tunnels require config_path"));
        }
        Ok(())
    }

    fn to_spec(&self, index: usize) -> TunnelSpec {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| PathBuf::from(s));
        TunnelSpec {
            name: self.name.clone(),
            kind: self.vpn_type,
            connect_params: ConnectParams {
                config_path: non_empty(self.config_path.as_str()),
                auth_path: self.auth_path.as_deref().and_then(non_empty),
            },
            priority: self.priority,
            index,
            probe_target: self.health_check_url.clone(),
            probe_interval: Duration::from_secs(self.health_check_interval),
            probe_timeout: Duration::from_secs(self.health_check_timeout),
            max_consecutive_failures: self.max_failures,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            enabled: self.enabled,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|ext| ext == "toml").unwrap_or(false)
}

impl FailoverConfig {
    /// Configuration holding only the given tunnels
    pub fn with_tunnels(vpns: Vec<TunnelConfig>) -> Self {
        Self {
            docker_network: default_docker_network(),
            log_level: default_log_level(),
            control_socket: default_control_socket(),
            idle_check_interval: default_idle_check_interval(),
            shutdown_grace: default_shutdown_grace(),
            routing_hook: None,
            drivers: DriverSettings::default(),
            vpns,
        }
    }

    /// Two OpenVPN tunnels backed by a WARP fallback
    pub fn default_config() -> Self {
        let mut primary = TunnelConfig::new(
            "primary-openvpn",
            TunnelKind::OpenVpn,
            "/etc/openvpn/client/vpn_config.conf",
        );
        primary.auth_path = Some("/etc/openvpn/client/auth.conf".to_string());

        let mut backup = TunnelConfig::new(
            "backup-openvpn",
            TunnelKind::OpenVpn,
            "/etc/openvpn/client/backup_config.conf",
        );
        backup.auth_path = Some("/etc/openvpn/client/backup_auth.conf".to_string());
        backup.priority = 2;

        let mut warp = TunnelConfig::new("warp-fallback", TunnelKind::Warp, "");
        warp.priority = 3;

        Self::with_tunnels(vec![primary, backup, warp])
    }

    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> FailoverResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FailoverError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

        let config = Self::parse(&content, is_toml(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn parse(content: &str, toml_format: bool) -> FailoverResult<Self> {
        if toml_format {
            toml::from_str(content)
                .map_err(|e| FailoverError::Config(format!("Failed to parse config: {}", e)))
        } else {
            serde_json::from_str(content)
                .map_err(|e| FailoverError::Config(format!("Failed to parse config: {}", e)))
        }
    }

    /// Save configuration to file, creating the parent directory
    pub fn save<P: AsRef<Path>>(&self, path: P) -> FailoverResult<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| FailoverError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| FailoverError::Config(format!("Failed to serialize config: {}", e)))?
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| FailoverError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| FailoverError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> FailoverResult<()> {
        if self.vpns.is_empty() {
            return Err(FailoverError::Config("No VPNs configured".to_string()));
        }
        if self.idle_check_interval == 0 {
            return Err(FailoverError::Config("idle_check_interval must be positive".to_string()));
        }

        let mut names = HashSet::new();
        for vpn in &self.vpns {
            if vpn.name.trim().is_empty() {
                return Err(FailoverError::Config("VPN with empty name".to_string()));
            }
            if !names.insert(vpn.name.as_str()) {
                return Err(FailoverError::Config(format!("Duplicate VPN name '{}'", vpn.name)));
            }
            vpn.validate()?;
        }
        Ok(())
    }

    /// Immutable tunnel specs, indexed by declaration order
    pub fn tunnel_specs(&self) -> Vec<TunnelSpec> {
        self.vpns.iter().enumerate().map(|(i, vpn)| vpn.to_spec(i)).collect()
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}
