//! Tunnel drivers
//!
//! Each supported tunnel technology is wrapped by a driver implementing
//! [`TunnelDriver`]. The failover controller only ever talks to that trait,
//! so adding a technology means adding a driver and registering it:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Failover Controller          │
//! └──────────────┬──────────────────────┘
//!                │  DriverSet (kind -> driver)
//!         ┌──────┴──────┐
//!         ▼             ▼
//!    ┌─────────┐   ┌─────────┐
//!    │ OpenVPN │   │  WARP   │   <- Tunnel Drivers
//!    └─────────┘   └─────────┘
//!    child process  warp-svc daemon
//! ```

pub mod common;
pub mod driver;
pub mod openvpn;
pub mod spec;
pub mod warp;

use std::sync::Arc;

use crate::config::DriverSettings;

pub use driver::{DriverHandle, DriverSet, TunnelDriver};
pub use openvpn::OpenVpnDriver;
pub use spec::{ConnectParams, TunnelKind, TunnelSpec};
pub use warp::WarpDriver;

/// Build the driver set for all built-in tunnel kinds
pub fn default_drivers(settings: &DriverSettings) -> DriverSet {
    let mut drivers = DriverSet::new();
    drivers.register(Arc::new(OpenVpnDriver::new(
        settings.openvpn_binary.clone(),
        settings.run_dir.clone(),
        settings.log_dir.clone(),
    )));
    drivers.register(Arc::new(WarpDriver::new(settings.warp_cli_binary.clone())));
    drivers
}
