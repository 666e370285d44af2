//! Read-only status snapshots
//!
//! The controller publishes a fresh [`StatusSnapshot`] after every change;
//! readers hold a [`StatusHandle`] and never touch the controller lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::tunnel::TunnelKind;

/// Per-connection status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    pub state: ConnectionState,
    pub priority: i64,
    pub enabled: bool,
    pub failure_count: u32,
    pub max_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// The connection currently carrying traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    pub state: ConnectionState,
    pub failure_count: u32,
    pub activated_at: Option<DateTime<Utc>>,
    /// Seconds since activation, computed when the snapshot is read
    pub uptime_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub service_running: bool,
    pub active: Option<ActiveStatus>,
    pub connections: Vec<ConnectionStatus>,
}

impl StatusSnapshot {
    /// Capture the registry as it is now
    pub fn capture(registry: &ConnectionRegistry, active: Option<&str>, service_running: bool) -> Self {
        let connections = registry
            .all()
            .map(|c| ConnectionStatus {
                name: c.name().to_string(),
                kind: c.spec().kind,
                state: c.state(),
                priority: c.spec().priority,
                enabled: c.spec().enabled,
                failure_count: c.failure_count(),
                max_failures: c.spec().max_consecutive_failures,
                last_health_check: c.last_probe_at(),
                last_failure: c.last_failure_at(),
            })
            .collect();

        let active = active.and_then(|name| registry.get(name)).map(|c| ActiveStatus {
            name: c.name().to_string(),
            kind: c.spec().kind,
            state: c.state(),
            failure_count: c.failure_count(),
            activated_at: c.activated_at(),
            uptime_secs: None,
        });

        let mut snapshot = Self {
            service_running,
            active,
            connections,
        };
        snapshot.refresh_uptime(Utc::now());
        snapshot
    }

    pub fn refresh_uptime(&mut self, now: DateTime<Utc>) {
        if let Some(active) = &mut self.active {
            active.uptime_secs = active
                .activated_at
                .map(|at| (now - at).num_seconds().max(0) as u64);
        }
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionStatus> {
        self.connections.iter().find(|c| c.name == name)
    }
}

/// Cheap, cloneable reader of the latest snapshot
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusHandle {
    pub fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// Latest snapshot with uptime computed for this moment
    pub fn current(&self) -> StatusSnapshot {
        let mut snapshot = self.rx.borrow().clone();
        snapshot.refresh_uptime(Utc::now());
        snapshot
    }
}

/// Format a duration in seconds as `1d 2h 3m 4s`
pub fn format_uptime(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if days > 0 || hours > 0 || mins > 0 {
        parts.push(format!("{}m", mins));
    }
    parts.push(format!("{}s", secs));
    parts.join(" ")
}
