//! vpn-failover - VPN Tunnel Failover Library
//!
//! Keeps a single outbound VPN tunnel up at all times by supervising a
//! prioritized list of tunnels:
//! - Tunnel drivers (OpenVPN child process, Cloudflare WARP daemon)
//! - Connection registry with per-tunnel state and failure bookkeeping
//! - Health monitoring of the active tunnel
//! - Failover to the best eligible candidate, re-scanning from top priority
//! - Supervisor with status/shutdown control socket

pub mod config;
pub mod control;
pub mod error;
pub mod failover;
pub mod health;
pub mod registry;
pub mod routing;
pub mod status;
pub mod supervisor;
pub mod tunnel;

// Re-export commonly used types
pub use config::{DriverSettings, FailoverConfig, TunnelConfig};
pub use control::{ControlRequest, ControlResponse, ControlServer};
pub use error::{FailoverError, FailoverResult};
pub use failover::FailoverController;
pub use health::{HealthMonitor, HttpProber, ProbeTarget, Prober};
pub use registry::{Connection, ConnectionRegistry, ConnectionState};
pub use routing::{HookRouteUpdater, LogRouteUpdater, RouteUpdater};
pub use status::{ActiveStatus, ConnectionStatus, StatusHandle, StatusSnapshot};
pub use supervisor::Supervisor;
pub use tunnel::{
    ConnectParams, DriverHandle, DriverSet, OpenVpnDriver, TunnelDriver, TunnelKind, TunnelSpec,
    WarpDriver,
};
