//! Service supervisor
//!
//! Owns the process lifetime: initial activation, the health monitor loop,
//! the control socket and the shutdown sequence.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::control::ControlServer;
use crate::error::FailoverResult;
use crate::failover::FailoverController;
use crate::health::{HealthMonitor, HttpProber, Prober};
use crate::registry::ConnectionRegistry;
use crate::routing::{self, RouteUpdater};
use crate::status::StatusHandle;
use crate::tunnel::{self, DriverSet};

pub struct Supervisor {
    config: FailoverConfig,
    controller: Arc<Mutex<FailoverController>>,
    monitor: Arc<HealthMonitor>,
    status: StatusHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        config: FailoverConfig,
        drivers: DriverSet,
        prober: Arc<dyn Prober>,
        router: Arc<dyn RouteUpdater>,
    ) -> FailoverResult<Self> {
        config.validate()?;
        let registry = ConnectionRegistry::new(config.tunnel_specs())?;

        for conn in registry.enabled_candidates() {
            if !drivers.has_driver(conn.spec().kind) {
                warn!("No driver registered for {} ({})", conn.name(), conn.spec().kind);
            }
        }

        let controller = FailoverController::new(registry, drivers, router);
        let status = controller.status_handle();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            controller: Arc::new(Mutex::new(controller)),
            monitor: Arc::new(HealthMonitor::new(prober)),
            status,
            shutdown_tx,
        })
    }

    /// Wire the built-in drivers, the HTTP prober and the configured router
    pub fn from_config(config: FailoverConfig) -> FailoverResult<Self> {
        let drivers = tunnel::default_drivers(&config.drivers);
        let prober = Arc::new(HttpProber::new()?);
        let router = routing::route_updater_for(&config);
        Self::new(config, drivers, prober, router)
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Sending `true` stops a running supervisor
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn controller(&self) -> Arc<Mutex<FailoverController>> {
        self.controller.clone()
    }

    /// One monitor cycle: probe the active tunnel, then let the controller act
    pub async fn tick(&self) {
        tick(&self.controller, &self.monitor).await;
    }

    /// Run until `signal` completes or shutdown is requested over the
    /// control socket
    pub async fn run<F>(self, signal: F) -> FailoverResult<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting VPN failover supervisor");
        self.check_drivers().await;

        let control = match ControlServer::bind(
            &self.config.control_socket,
            self.status.clone(),
            self.shutdown_tx.clone(),
        ) {
            Ok(server) => Some(tokio::spawn(server.serve())),
            Err(e) => {
                warn!("Control socket unavailable: {}", e);
                None
            }
        };

        if let Err(e) = self.controller.lock().await.activate_best().await {
            warn!("Initial activation failed: {}; retrying every {:?}", e, self.config.idle_interval());
        }

        let mut monitor = tokio::spawn(monitor_loop(
            self.controller.clone(),
            self.monitor.clone(),
            self.config.idle_interval(),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = signal => info!("Termination signal received"),
            _ = stopped(&mut shutdown_rx) => info!("Shutdown requested"),
        }
        self.shutdown_tx.send_replace(true);

        let grace = self.config.shutdown_grace();
        if timeout(grace, &mut monitor).await.is_err() {
            warn!("Health monitor did not stop within {:?}, aborting it", grace);
            monitor.abort();
        }

        let controller = self.controller.clone();
        if timeout(grace, async move { controller.lock().await.shutdown().await })
            .await
            .is_err()
        {
            warn!("Disconnect did not finish within {:?}", grace);
        }

        if let Some(control) = control {
            let _ = control.await;
        }

        info!("VPN failover supervisor stopped");
        Ok(())
    }

    async fn check_drivers(&self) {
        let controller = self.controller.lock().await;
        let kinds: HashSet<_> = controller
            .registry()
            .enabled_candidates()
            .map(|c| c.spec().kind)
            .collect();
        for kind in kinds {
            if let Some(driver) = controller.drivers().get(kind) {
                if !driver.is_available().await {
                    warn!("{} tooling is not installed; {} tunnels will fail to connect", kind, kind);
                }
            }
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn tick(controller: &Mutex<FailoverController>, monitor: &HealthMonitor) {
    monitor.run_cycle(controller).await;
    if let Err(e) = controller.lock().await.evaluate().await {
        debug!("Monitor tick ended without an active tunnel: {}", e);
    }
}

async fn monitor_loop(
    controller: Arc<Mutex<FailoverController>>,
    monitor: Arc<HealthMonitor>,
    idle: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Health monitor started");
    loop {
        let interval = controller.lock().await.next_interval(idle);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped(&mut shutdown_rx) => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
        tick(&controller, &monitor).await;
    }
    info!("Health monitor stopped");
}
