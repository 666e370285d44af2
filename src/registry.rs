//! Connection registry
//!
//! One [`Connection`] per configured tunnel, kept in candidate order
//! (priority, then declaration index). The registry only does bookkeeping;
//! the failover controller drives state transitions and the health monitor
//! records probe results, both through the methods below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FailoverError, FailoverResult};
use crate::tunnel::{DriverHandle, TunnelSpec};

/// Lifecycle of a connection
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
///                  |   |             |              ^  ^
///                  |   +--> Failed <-+--------------+  |
///                  +-----------------------------------+
/// ```
/// `Failed` re-enters through `Disconnected` once its cooldown has passed,
/// or through `Disconnecting` when it was the active connection.
/// `Connecting -> Disconnecting` only happens when shutdown interrupts a
/// bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Failed, Disconnecting)
                | (Failed, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    /// Connecting or connected; at most one connection may be in either
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record for one tunnel
#[derive(Debug)]
pub struct Connection {
    spec: Arc<TunnelSpec>,
    state: ConnectionState,
    failure_count: u32,
    last_probe_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    activated_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last failure; drives the cooldown window
    cooldown_from: Option<Instant>,
    handle: Option<DriverHandle>,
    /// Bumped on every activation so stale probe results can be discarded
    activation_id: u64,
}

impl Connection {
    pub(crate) fn new(spec: Arc<TunnelSpec>) -> Self {
        Self {
            spec,
            state: ConnectionState::Disconnected,
            failure_count: 0,
            last_probe_at: None,
            last_failure_at: None,
            activated_at: None,
            cooldown_from: None,
            handle: None,
            activation_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<TunnelSpec> {
        &self.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_probe_at(&self) -> Option<DateTime<Utc>> {
        self.last_probe_at
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
    }

    pub fn activation_id(&self) -> u64 {
        self.activation_id
    }

    /// Still inside `reconnect_delay` since the last recorded failure
    pub fn in_cooldown(&self, now: Instant) -> bool {
        match self.cooldown_from {
            Some(failed_at) => now.saturating_duration_since(failed_at) < self.spec.reconnect_delay,
            None => false,
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) -> FailoverResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(FailoverError::InvalidState(format!(
                "{}: {} -> {} is not a valid transition",
                self.spec.name, self.state, next
            )));
        }
        debug!("{}: {} -> {}", self.spec.name, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Enter `Connecting`, stamping a new activation
    pub(crate) fn begin_activation(&mut self) -> FailoverResult<()> {
        self.transition(ConnectionState::Connecting)?;
        self.activated_at = Some(Utc::now());
        self.activation_id += 1;
        Ok(())
    }

    pub(crate) fn complete_activation(&mut self, handle: DriverHandle) -> FailoverResult<()> {
        self.transition(ConnectionState::Connected)?;
        self.handle = Some(handle);
        self.failure_count = 0;
        Ok(())
    }

    pub(crate) fn begin_deactivation(&mut self) -> FailoverResult<Option<DriverHandle>> {
        self.transition(ConnectionState::Disconnecting)?;
        Ok(self.handle.take())
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut DriverHandle> {
        self.handle.as_mut()
    }

    pub(crate) fn record_probe_success(&mut self) {
        self.last_probe_at = Some(Utc::now());
        self.failure_count = 0;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(Utc::now());
        self.cooldown_from = Some(Instant::now());
    }
}

/// Owner of every `Connection`, ordered by (priority, declaration index)
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new(specs: Vec<TunnelSpec>) -> FailoverResult<Self> {
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.clone()) {
                return Err(FailoverError::Config(format!("Duplicate VPN name '{}'", spec.name)));
            }
        }

        let mut connections: Vec<Connection> = specs
            .into_iter()
            .map(|spec| Connection::new(Arc::new(spec)))
            .collect();
        connections.sort_by_key(|c| c.spec.order_key());

        Ok(Self { connections })
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name() == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.name() == name)
    }

    /// Every connection in candidate order
    pub fn all(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Enabled connections in candidate order
    pub fn enabled_candidates(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(|c| c.spec.enabled)
    }

    /// Number of connections connecting or connected
    pub fn active_count(&self) -> usize {
        self.connections.iter().filter(|c| c.state.is_active()).count()
    }
}
