//! Failover controller
//!
//! Decides which tunnel carries traffic. Runs inside the monitor tick under
//! the service lock, so activations and failovers are strictly serialized
//! and at most one connection is ever connecting or connected.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{FailoverError, FailoverResult};
use crate::health::ProbeTarget;
use crate::registry::{Connection, ConnectionRegistry, ConnectionState};
use crate::routing::RouteUpdater;
use crate::status::{StatusHandle, StatusSnapshot};
use crate::tunnel::{DriverHandle, DriverSet};

/// Hard ceilings around driver calls, above the drivers' own windows
const CONNECT_CEILING: Duration = Duration::from_secs(20);
const DISCONNECT_CEILING: Duration = Duration::from_secs(20);
const LIVENESS_CEILING: Duration = Duration::from_secs(5);

pub struct FailoverController {
    registry: ConnectionRegistry,
    drivers: DriverSet,
    router: Arc<dyn RouteUpdater>,
    active: Option<String>,
    running: bool,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl FailoverController {
    pub fn new(registry: ConnectionRegistry, drivers: DriverSet, router: Arc<dyn RouteUpdater>) -> Self {
        let (status_tx, _) = watch::channel(StatusSnapshot::capture(&registry, None, true));
        Self {
            registry,
            drivers,
            router,
            active: None,
            running: true,
            status_tx,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(self.status_tx.subscribe())
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn drivers(&self) -> &DriverSet {
        &self.drivers
    }

    /// Name of the connected tunnel, if any
    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Connection> {
        self.active.as_deref().and_then(|name| self.registry.get(name))
    }

    /// Monitor cadence: the active tunnel's probe interval, `idle` otherwise
    pub fn next_interval(&self, idle: Duration) -> Duration {
        match self.active() {
            Some(conn) if conn.state() == ConnectionState::Connected => conn.spec().probe_interval,
            _ => idle,
        }
    }

    pub(crate) fn publish_status(&self) {
        self.status_tx
            .send_replace(StatusSnapshot::capture(&self.registry, self.active.as_deref(), self.running));
    }

    fn connection_mut(&mut self, name: &str) -> FailoverResult<&mut Connection> {
        self.registry
            .get_mut(name)
            .ok_or_else(|| FailoverError::NotFound(format!("VPN '{}'", name)))
    }

    pub fn probe_target(&self) -> Option<ProbeTarget> {
        let conn = self.active()?;
        if conn.state() != ConnectionState::Connected {
            return None;
        }
        Some(ProbeTarget {
            tunnel: conn.name().to_string(),
            url: conn.spec().probe_target.clone(),
            timeout: conn.spec().probe_timeout,
            activation_id: conn.activation_id(),
        })
    }

    /// The connection a finished probe belongs to, if it is still the same
    /// connected activation
    pub(crate) fn probed_connection(&mut self, target: &ProbeTarget) -> Option<&mut Connection> {
        if self.active.as_deref() != Some(target.tunnel.as_str()) {
            return None;
        }
        self.registry
            .get_mut(&target.tunnel)
            .filter(|c| c.state() == ConnectionState::Connected && c.activation_id() == target.activation_id)
    }

    /// Bring up `name`. Requires that nothing is active.
    pub async fn activate(&mut self, name: &str) -> FailoverResult<()> {
        if let Some(active) = &self.active {
            return Err(FailoverError::InvalidState(format!(
                "cannot activate {} while {} is active",
                name, active
            )));
        }

        let conn = self.connection_mut(name)?;
        let spec = Arc::clone(conn.spec());
        conn.begin_activation()?;
        self.publish_status();
        info!("Activating VPN: {} ({}, priority {})", name, spec.kind, spec.priority);

        let result = match self.drivers.get(spec.kind) {
            Some(driver) => match timeout(CONNECT_CEILING, driver.connect(&spec)).await {
                Ok(result) => result,
                Err(_) => {
                    // The abandoned bring-up may still complete on the driver side
                    warn!("Connect of {} did not return within {:?}, tearing it down", name, CONNECT_CEILING);
                    if timeout(DISCONNECT_CEILING, driver.disconnect(DriverHandle::session(name)))
                        .await
                        .is_err()
                    {
                        warn!("Disconnect of {} did not finish within {:?}", name, DISCONNECT_CEILING);
                    }
                    Err(FailoverError::connect(
                        name,
                        format!("driver did not return within {:?}", CONNECT_CEILING),
                    ))
                }
            },
            None => Err(FailoverError::connect(name, format!("no {} driver registered", spec.kind))),
        };

        match result {
            Ok(handle) => {
                self.connection_mut(name)?.complete_activation(handle)?;
                self.active = Some(name.to_string());
                self.publish_status();
                info!("VPN {} is now active", name);

                if let Err(e) = self.router.on_activated(name).await {
                    warn!("Routing update for {} failed: {}", name, e);
                }
                Ok(())
            }
            Err(e) => {
                let conn = self.connection_mut(name)?;
                conn.transition(ConnectionState::Failed)?;
                conn.record_failure();
                self.publish_status();
                warn!("Failed to activate {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Activate the first eligible enabled candidate in priority order.
    ///
    /// Candidates still cooling down from a failure are skipped; failed ones
    /// whose cooldown has passed are reset and tried again.
    pub async fn activate_best(&mut self) -> FailoverResult<String> {
        if let Some(active) = &self.active {
            return Ok(active.clone());
        }

        let candidates: Vec<String> = self
            .registry
            .enabled_candidates()
            .map(|c| c.name().to_string())
            .collect();

        for name in candidates {
            let conn = self.connection_mut(&name)?;
            if conn.in_cooldown(Instant::now()) {
                debug!("Skipping {}: in cooldown", name);
                continue;
            }
            if conn.state() == ConnectionState::Failed {
                conn.transition(ConnectionState::Disconnected)?;
            }
            if conn.state() != ConnectionState::Disconnected {
                continue;
            }

            if self.activate(&name).await.is_ok() {
                return Ok(name);
            }
        }

        self.publish_status();
        error!("No VPN available: every enabled tunnel is failed, cooling down or disabled");
        Err(FailoverError::NoCandidateAvailable)
    }

    /// Whether the active connection must be replaced
    pub fn should_failover(&self) -> bool {
        match self.active() {
            Some(conn) => {
                conn.state() == ConnectionState::Failed
                    || conn.failure_count() >= conn.spec().max_consecutive_failures
            }
            None => false,
        }
    }

    /// Tear down the active connection and activate the best remaining one
    pub async fn perform_failover(&mut self) -> FailoverResult<String> {
        if let Some(name) = self.active.clone() {
            warn!("Failing over from {}", name);
            self.deactivate(&name).await?;
        }
        self.activate_best().await
    }

    /// Disconnect `name`. A no-op when already disconnected.
    ///
    /// A connection without a stored handle (an interrupted bring-up, a
    /// failed connect) is torn down through a session handle, so daemon-held
    /// tunnels are released too.
    pub async fn deactivate(&mut self, name: &str) -> FailoverResult<()> {
        let conn = self.connection_mut(name)?;
        if conn.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        let kind = conn.spec().kind;
        let handle = conn
            .begin_deactivation()?
            .unwrap_or_else(|| DriverHandle::session(name));
        self.publish_status();
        info!("Disconnecting VPN: {}", name);

        match self.drivers.get(kind) {
            Some(driver) => {
                if timeout(DISCONNECT_CEILING, driver.disconnect(handle)).await.is_err() {
                    warn!("Disconnect of {} did not finish within {:?}", name, DISCONNECT_CEILING);
                }
            }
            None => warn!("No {} driver registered to disconnect {}", kind, name),
        }

        self.connection_mut(name)?.transition(ConnectionState::Disconnected)?;
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        self.publish_status();
        Ok(())
    }

    /// Mark the active connection failed if its driver reports it dead
    async fn check_liveness(&mut self) {
        let Some(name) = self.active.clone() else {
            return;
        };
        let Some(conn) = self.registry.get_mut(&name) else {
            return;
        };
        if conn.state() != ConnectionState::Connected {
            return;
        }
        let Some(driver) = self.drivers.get(conn.spec().kind) else {
            return;
        };

        let alive = match conn.handle_mut() {
            Some(handle) => match timeout(LIVENESS_CEILING, driver.is_alive(handle)).await {
                Ok(alive) => alive,
                Err(_) => {
                    debug!("Liveness check for {} timed out", name);
                    true
                }
            },
            None => true,
        };

        if !alive {
            error!("VPN {} is no longer running", name);
            conn.record_failure();
            if let Err(e) = conn.transition(ConnectionState::Failed) {
                warn!("{}", e);
            }
            self.publish_status();
        }
    }

    /// One controller tick, run after the probe of the same cycle
    pub async fn evaluate(&mut self) -> FailoverResult<()> {
        self.check_liveness().await;

        if self.should_failover() {
            self.perform_failover().await?;
        } else if self.active.is_none() {
            self.activate_best().await?;
        }
        Ok(())
    }

    /// Disconnect every connection that is not already disconnected and
    /// mark the service stopped.
    ///
    /// Besides the active tunnel this catches a bring-up that was cut short
    /// by an aborted monitor tick and is still `Connecting`.
    pub async fn shutdown(&mut self) {
        self.running = false;
        let pending: Vec<String> = self
            .registry
            .all()
            .filter(|c| c.state() != ConnectionState::Disconnected)
            .map(|c| c.name().to_string())
            .collect();

        for name in pending {
            if let Err(e) = self.deactivate(&name).await {
                warn!("Failed to disconnect {} during shutdown: {}", name, e);
            }
        }
        self.active = None;
        self.publish_status();
        info!("Failover controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthMonitor;
    use crate::tunnel::driver::MockTunnelDriver;
    use crate::tunnel::{ConnectParams, TunnelDriver, TunnelKind, TunnelSpec};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRouter {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RouteUpdater for RecordingRouter {
        async fn on_activated(&self, tunnel: &str) -> FailoverResult<()> {
            self.calls.lock().unwrap().push(tunnel.to_string());
            Ok(())
        }
    }

    /// Driver whose bring-up never returns, recording every disconnect
    #[derive(Default)]
    struct StuckDriver {
        disconnects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TunnelDriver for StuckDriver {
        fn kind(&self) -> TunnelKind {
            TunnelKind::OpenVpn
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn connect(&self, _spec: &TunnelSpec) -> FailoverResult<DriverHandle> {
            std::future::pending().await
        }

        async fn disconnect(&self, handle: DriverHandle) {
            self.disconnects.lock().unwrap().push(handle.tunnel().to_string());
        }

        async fn is_alive(&self, _handle: &mut DriverHandle) -> bool {
            true
        }
    }

    fn spec(name: &str, priority: i64, index: usize, max_failures: u32) -> TunnelSpec {
        TunnelSpec {
            name: name.to_string(),
            kind: TunnelKind::OpenVpn,
            connect_params: ConnectParams::default(),
            priority,
            index,
            probe_target: "http://probe.test/".to_string(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_failures: max_failures,
            reconnect_delay: Duration::from_secs(60),
            enabled: true,
        }
    }

    fn controller(specs: Vec<TunnelSpec>, driver: MockTunnelDriver) -> (FailoverController, Arc<RecordingRouter>) {
        let mut drivers = DriverSet::new();
        drivers.register(Arc::new(driver));
        let router = Arc::new(RecordingRouter::default());
        let registry = ConnectionRegistry::new(specs).unwrap();
        (FailoverController::new(registry, drivers, router.clone()), router)
    }

    fn driver_failing(names: &'static [&'static str]) -> MockTunnelDriver {
        let mut driver = MockTunnelDriver::new();
        driver.expect_kind().return_const(TunnelKind::OpenVpn);
        driver.expect_connect().returning(move |spec| {
            if names.contains(&spec.name.as_str()) {
                Err(FailoverError::connect(&spec.name, "connection refused"))
            } else {
                Ok(DriverHandle::session(&spec.name))
            }
        });
        driver
    }

    #[tokio::test]
    async fn test_activate_best_skips_failed_connect() {
        let (mut ctl, router) = controller(
            vec![spec("primary", 1, 0, 3), spec("backup", 2, 1, 3)],
            driver_failing(&["primary"]),
        );

        assert_eq!(ctl.activate_best().await.unwrap(), "backup");
        assert_eq!(ctl.active_name(), Some("backup"));

        let primary = ctl.registry().get("primary").unwrap();
        assert_eq!(primary.state(), ConnectionState::Failed);
        assert_eq!(primary.failure_count(), 1);
        assert!(primary.last_failure_at().is_some());

        assert_eq!(*router.calls.lock().unwrap(), vec!["backup".to_string()]);
        assert_eq!(ctl.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn test_no_candidate_when_all_connects_fail() {
        let (mut ctl, router) = controller(vec![spec("primary", 1, 0, 3)], driver_failing(&["primary"]));

        assert!(matches!(ctl.activate_best().await, Err(FailoverError::NoCandidateAvailable)));
        assert_eq!(ctl.active_name(), None);
        // Still cooling down on the next tick
        assert!(matches!(ctl.evaluate().await, Err(FailoverError::NoCandidateAvailable)));
        assert!(router.calls.lock().unwrap().is_empty());
        assert!(ctl.status_handle().current().active.is_none());
    }

    #[tokio::test]
    async fn test_single_failure_trips_when_max_failures_is_one() {
        let mut driver = driver_failing(&[]);
        driver.expect_is_alive().returning(|_| true);
        driver.expect_disconnect().times(1).returning(|_| ());
        let (mut ctl, _) = controller(vec![spec("primary", 1, 0, 1), spec("backup", 2, 1, 1)], driver);

        ctl.activate_best().await.unwrap();
        assert!(!ctl.should_failover());

        let target = ctl.probe_target().unwrap();
        let conn = ctl.probed_connection(&target).unwrap();
        HealthMonitor::record(conn, &Err(FailoverError::probe("primary", "timed out")));
        assert!(ctl.should_failover());

        ctl.evaluate().await.unwrap();
        assert_eq!(ctl.active_name(), Some("backup"));
        assert_eq!(ctl.registry().get("primary").unwrap().state(), ConnectionState::Disconnected);
        assert_eq!(ctl.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_process_is_failed_over() {
        let mut driver = driver_failing(&[]);
        driver
            .expect_is_alive()
            .returning(|handle| handle.tunnel() != "primary");
        driver.expect_disconnect().returning(|_| ());
        let (mut ctl, router) = controller(vec![spec("primary", 1, 0, 3), spec("backup", 2, 1, 3)], driver);

        ctl.activate_best().await.unwrap();
        ctl.evaluate().await.unwrap();

        assert_eq!(ctl.active_name(), Some("backup"));
        assert_eq!(ctl.registry().get("primary").unwrap().failure_count(), 1);
        assert_eq!(router.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_disconnected_is_noop() {
        let mut driver = driver_failing(&[]);
        driver.expect_disconnect().never();
        let (mut ctl, _) = controller(vec![spec("primary", 1, 0, 3)], driver);

        ctl.deactivate("primary").await.unwrap();
        assert!(matches!(ctl.deactivate("missing").await, Err(FailoverError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_probe_result_is_discarded() {
        let mut driver = driver_failing(&[]);
        driver.expect_disconnect().returning(|_| ());
        let (mut ctl, _) = controller(vec![spec("primary", 1, 0, 3)], driver);

        ctl.activate_best().await.unwrap();
        let stale = ctl.probe_target().unwrap();

        ctl.deactivate("primary").await.unwrap();
        ctl.activate("primary").await.unwrap();

        assert!(ctl.probed_connection(&stale).is_none());
        assert!(ctl.probe_target().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_active() {
        let mut driver = driver_failing(&[]);
        driver.expect_disconnect().times(1).returning(|_| ());
        let (mut ctl, _) = controller(vec![spec("primary", 1, 0, 3)], driver);
        let status = ctl.status_handle();

        ctl.activate_best().await.unwrap();
        assert_eq!(status.current().active.unwrap().name, "primary");
        assert_eq!(ctl.next_interval(Duration::from_secs(10)), Duration::from_secs(30));

        ctl.shutdown().await;
        let snapshot = status.current();
        assert!(!snapshot.service_running);
        assert!(snapshot.active.is_none());
        assert_eq!(ctl.next_interval(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_past_ceiling_is_torn_down() {
        let driver = Arc::new(StuckDriver::default());
        let mut drivers = DriverSet::new();
        drivers.register(driver.clone());
        let registry = ConnectionRegistry::new(vec![spec("primary", 1, 0, 3)]).unwrap();
        let mut ctl = FailoverController::new(registry, drivers, Arc::new(RecordingRouter::default()));

        let err = ctl.activate("primary").await.unwrap_err();
        assert!(matches!(err, FailoverError::Connect { .. }));
        assert_eq!(*driver.disconnects.lock().unwrap(), vec!["primary".to_string()]);
        assert_eq!(ctl.registry().get("primary").unwrap().state(), ConnectionState::Failed);
        assert_eq!(ctl.active_name(), None);
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_interrupted_bring_up() {
        let driver = Arc::new(StuckDriver::default());
        let mut drivers = DriverSet::new();
        drivers.register(driver.clone());
        let registry = ConnectionRegistry::new(vec![spec("primary", 1, 0, 3), spec("backup", 2, 1, 3)]).unwrap();
        let ctl = Arc::new(tokio::sync::Mutex::new(FailoverController::new(
            registry,
            drivers,
            Arc::new(RecordingRouter::default()),
        )));

        let bring_up = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                let _ = ctl.lock().await.activate("primary").await;
            })
        };
        while ctl.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }
        bring_up.abort();
        let _ = bring_up.await;

        let mut ctl = ctl.lock().await;
        assert_eq!(ctl.registry().get("primary").unwrap().state(), ConnectionState::Connecting);

        ctl.shutdown().await;
        assert_eq!(ctl.registry().get("primary").unwrap().state(), ConnectionState::Disconnected);
        assert_eq!(ctl.registry().get("backup").unwrap().state(), ConnectionState::Disconnected);
        assert_eq!(*driver.disconnects.lock().unwrap(), vec!["primary".to_string()]);
        assert_eq!(ctl.registry().active_count(), 0);
    }
}
