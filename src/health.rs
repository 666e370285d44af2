//! Health monitoring of the active tunnel
//!
//! Only the connected tunnel is probed. A probe only updates bookkeeping on
//! the connection; whether that warrants a failover is decided by the
//! controller on the same tick.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{FailoverError, FailoverResult};
use crate::failover::FailoverController;
use crate::registry::Connection;

/// Connectivity check through the current egress path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    /// Succeeds only if `target` answered with a 2xx within `timeout`
    async fn probe(&self, tunnel: &str, target: &str, timeout: Duration) -> FailoverResult<()>;
}

/// HTTP GET prober
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> FailoverResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("vpn-failover/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FailoverError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, tunnel: &str, target: &str, timeout: Duration) -> FailoverResult<()> {
        let response = self
            .client
            .get(target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FailoverError::probe(tunnel, format!("timed out after {:?}", timeout))
                } else {
                    FailoverError::probe(tunnel, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FailoverError::probe(tunnel, format!("{} answered {}", target, status)));
        }
        Ok(())
    }
}

/// What to probe this cycle, captured under the controller lock
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub tunnel: String,
    pub url: String,
    pub timeout: Duration,
    pub activation_id: u64,
}

pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
}

impl HealthMonitor {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Probe the connected tunnel once and record the outcome.
    ///
    /// The controller lock is not held while the probe is in flight. The
    /// result is dropped if the tunnel was replaced in the meantime.
    pub async fn run_cycle(&self, controller: &Mutex<FailoverController>) {
        let target = controller.lock().await.probe_target();
        let Some(target) = target else {
            debug!("No connected tunnel, skipping health check");
            return;
        };

        let outcome = self.prober.probe(&target.tunnel, &target.url, target.timeout).await;

        let mut controller = controller.lock().await;
        match controller.probed_connection(&target) {
            Some(conn) => Self::record(conn, &outcome),
            None => debug!("Discarding probe result for {}: no longer active", target.tunnel),
        }
        controller.publish_status();
    }

    pub(crate) fn record(conn: &mut Connection, outcome: &FailoverResult<()>) {
        match outcome {
            Ok(()) => {
                conn.record_probe_success();
                debug!("Health check passed for {}", conn.name());
            }
            Err(e) => {
                conn.record_failure();
                warn!(
                    "Health check failed for {} (failure {}/{}): {}",
                    conn.name(),
                    conn.failure_count(),
                    conn.spec().max_consecutive_failures,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::routing::LogRouteUpdater;
    use crate::tunnel::driver::MockTunnelDriver;
    use crate::tunnel::{ConnectParams, DriverHandle, DriverSet, TunnelKind, TunnelSpec};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn spec() -> TunnelSpec {
        TunnelSpec {
            name: "primary".to_string(),
            kind: TunnelKind::OpenVpn,
            connect_params: ConnectParams::default(),
            priority: 1,
            index: 0,
            probe_target: "http://probe.test/".to_string(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            reconnect_delay: Duration::from_secs(60),
            enabled: true,
        }
    }

    /// One-shot HTTP server answering every request with `status_line`
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/ip", addr)
    }

    #[tokio::test]
    async fn test_http_probe_success_and_non_2xx() {
        let prober = HttpProber::new().unwrap();

        let ok = serve("200 OK").await;
        assert!(prober.probe("primary", &ok, Duration::from_secs(5)).await.is_ok());

        let bad = serve("503 Service Unavailable").await;
        let err = prober.probe("primary", &bad, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("503"), "{err}");
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HttpProber::new().unwrap();
        let err = prober
            .probe("primary", &format!("http://{}/", addr), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::Probe { .. }));
    }

    #[test]
    fn test_record_counts_and_resets() {
        let mut registry = ConnectionRegistry::new(vec![spec()]).unwrap();
        let conn = registry.get_mut("primary").unwrap();

        let failure = Err(FailoverError::probe("primary", "timed out"));
        HealthMonitor::record(conn, &failure);
        HealthMonitor::record(conn, &failure);
        assert_eq!(conn.failure_count(), 2);
        assert!(conn.last_failure_at().is_some());
        assert!(conn.last_probe_at().is_none());

        HealthMonitor::record(conn, &Ok(()));
        assert_eq!(conn.failure_count(), 0);
        assert!(conn.last_probe_at().is_some());
    }

    fn controller() -> Mutex<FailoverController> {
        let mut driver = MockTunnelDriver::new();
        driver.expect_kind().return_const(TunnelKind::OpenVpn);
        driver
            .expect_connect()
            .returning(|spec| Ok(DriverHandle::session(&spec.name)));
        let mut drivers = DriverSet::new();
        drivers.register(Arc::new(driver));

        let registry = ConnectionRegistry::new(vec![spec()]).unwrap();
        Mutex::new(FailoverController::new(
            registry,
            drivers,
            Arc::new(LogRouteUpdater::new("vpn-network")),
        ))
    }

    #[tokio::test]
    async fn test_cycle_records_failure_on_active_tunnel() {
        let controller = controller();
        controller.lock().await.activate_best().await.unwrap();

        let mut prober = MockProber::new();
        prober
            .expect_probe()
            .withf(|tunnel, target, timeout| {
                tunnel == "primary" && target == "http://probe.test/" && *timeout == Duration::from_secs(10)
            })
            .times(1)
            .returning(|tunnel, _, _| Err(FailoverError::probe(tunnel, "timed out")));

        HealthMonitor::new(Arc::new(prober)).run_cycle(&controller).await;

        let controller = controller.lock().await;
        assert_eq!(controller.registry().get("primary").unwrap().failure_count(), 1);
        let snapshot = controller.status_handle().current();
        assert_eq!(snapshot.active.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_cycle_skips_when_nothing_connected() {
        let controller = controller();
        let mut prober = MockProber::new();
        prober.expect_probe().never();

        HealthMonitor::new(Arc::new(prober)).run_cycle(&controller).await;
        assert!(controller.lock().await.probe_target().is_none());
    }
}
