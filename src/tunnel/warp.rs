use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FailoverError, FailoverResult};
use super::common;
use super::driver::{DriverHandle, TunnelDriver};
use super::spec::{TunnelKind, TunnelSpec};

/// Ceiling on waiting for the daemon to report `Connected`
pub const BRING_UP_WINDOW: Duration = Duration::from_secs(5);
/// Ceiling on a disconnect request
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

const PRE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_POLL: Duration = Duration::from_millis(500);

/// Connection status as reported by `warp-cli status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarpStatus {
    Connected,
    Connecting,
    Disconnected,
    Unknown(String),
}

/// Parse `warp-cli status` output.
///
/// Recent clients print `Status update: Connected`; older ones print the
/// bare state on the first line.
pub fn parse_warp_status(output: &str) -> WarpStatus {
    let state = output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Status update:"))
        .or_else(|| output.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("")
        .trim();

    match state.split_whitespace().next().unwrap_or("") {
        "Connected" => WarpStatus::Connected,
        "Connecting" => WarpStatus::Connecting,
        "Disconnected" => WarpStatus::Disconnected,
        _ => WarpStatus::Unknown(state.to_string()),
    }
}

/// Cloudflare WARP driver: talks to the local `warp-svc` daemon
/// through `warp-cli`. The daemon owns the session, so the handle holds
/// no process.
pub struct WarpDriver {
    binary: String,
    bring_up_window: Duration,
}

impl WarpDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            bring_up_window: BRING_UP_WINDOW,
        }
    }

    /// Shorten the bring-up window. Never exceeds `BRING_UP_WINDOW`.
    pub fn with_bring_up_window(mut self, window: Duration) -> Self {
        self.bring_up_window = window.min(BRING_UP_WINDOW);
        self
    }

    async fn status(&self) -> FailoverResult<WarpStatus> {
        let stdout = common::run_checked(&self.binary, &["status"], STATUS_TIMEOUT).await?;
        Ok(parse_warp_status(&stdout))
    }

    /// Issue `warp-cli connect` and wait for the daemon to report it
    async fn bring_up(&self, spec: &TunnelSpec) -> FailoverResult<()> {
        common::run_checked(&self.binary, &["connect"], CONNECT_TIMEOUT)
            .await
            .map_err(|e| FailoverError::connect(&spec.name, e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.bring_up_window;
        let mut last = WarpStatus::Unknown(String::new());
        loop {
            match self.status().await {
                Ok(WarpStatus::Connected) => return Ok(()),
                Ok(status) => last = status,
                Err(e) => debug!("WARP status check failed: {}", e),
            }

            if tokio::time::Instant::now() + STATUS_POLL > deadline {
                return Err(FailoverError::connect(
                    &spec.name,
                    format!("WARP not connected after {:?} (last status: {:?})", self.bring_up_window, last),
                ));
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }
}

#[async_trait]
impl TunnelDriver for WarpDriver {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Warp
    }

    async fn is_available(&self) -> bool {
        common::get_binary_version(&self.binary).await.is_ok()
    }

    async fn connect(&self, spec: &TunnelSpec) -> FailoverResult<DriverHandle> {
        let version = common::get_binary_version(&self.binary)
            .await
            .map_err(|e| FailoverError::connect(&spec.name, format!("WARP CLI not usable: {}", e)))?;
        info!("Connecting WARP for {} ({})", spec.name, version);

        // Drop any stale session first; failure here is expected when idle
        if let Err(e) = common::run_checked(&self.binary, &["disconnect"], PRE_DISCONNECT_TIMEOUT).await {
            debug!("Pre-connect WARP disconnect: {}", e);
        }

        match self.bring_up(spec).await {
            Ok(()) => {
                info!("WARP connected for {}", spec.name);
                Ok(DriverHandle::session(&spec.name))
            }
            Err(e) => {
                // The daemon keeps trying on its own unless told to stop
                if let Err(cleanup) = common::run_checked(&self.binary, &["disconnect"], CLEANUP_TIMEOUT).await {
                    warn!("Failed to cancel WARP bring-up for {}: {}", spec.name, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self, handle: DriverHandle) {
        info!("Disconnecting WARP for {}", handle.tunnel());
        if let Err(e) = common::run_checked(&self.binary, &["disconnect"], DISCONNECT_GRACE).await {
            warn!("Error disconnecting WARP for {}: {}", handle.tunnel(), e);
        }
    }

    /// Dead only when the daemon says so; a slow or failing `warp-cli`
    /// is left to the HTTP health check
    async fn is_alive(&self, handle: &mut DriverHandle) -> bool {
        match self.status().await {
            Ok(WarpStatus::Disconnected) => false,
            Ok(_) => true,
            Err(e) => {
                debug!("WARP status for {} unavailable: {}", handle.tunnel(), e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_parse_status_update_format() {
        assert_eq!(parse_warp_status("Status update: Connected\nSuccess\n"), WarpStatus::Connected);
        assert_eq!(
            parse_warp_status("Status update: Disconnected\nReason: Manual Disconnection\n"),
            WarpStatus::Disconnected
        );
        assert_eq!(parse_warp_status("Status update: Connecting\n"), WarpStatus::Connecting);
    }

    #[test]
    fn test_parse_bare_and_unknown_status() {
        assert_eq!(parse_warp_status("Connected\n"), WarpStatus::Connected);
        assert_eq!(
            parse_warp_status("Registration Missing\n"),
            WarpStatus::Unknown("Registration Missing".to_string())
        );
        assert_eq!(parse_warp_status(""), WarpStatus::Unknown(String::new()));
    }

    fn spec() -> TunnelSpec {
        TunnelSpec {
            name: "warp-fallback".to_string(),
            kind: TunnelKind::Warp,
            connect_params: Default::default(),
            priority: 3,
            index: 2,
            probe_target: "https://httpbin.org/ip".to_string(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            reconnect_delay: Duration::from_secs(60),
            enabled: true,
        }
    }

    /// Fake `warp-cli` logging each subcommand to `calls` and running
    /// `status_body` for `status`
    fn fake_warp_cli(dir: &tempfile::TempDir, status_body: &str) -> (String, PathBuf) {
        let calls = dir.path().join("calls");
        let path = dir.path().join("warp-cli");
        let script = format!(
            "#!/bin/sh\necho \"$1\" >> {calls}\ncase \"$1\" in\n  --version) echo 'warp-cli 2024.6.0' ;;\n  status) {status_body} ;;\nesac\nexit 0\n",
            calls = calls.display(),
            status_body = status_body,
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (path.to_string_lossy().to_string(), calls)
    }

    fn calls(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_missing_cli_is_connect_error() {
        let driver = WarpDriver::new("/nonexistent/warp-cli");
        let err = driver.connect(&spec()).await.unwrap_err();
        assert!(matches!(err, FailoverError::Connect { ref tunnel, .. } if tunnel == "warp-fallback"));
        assert!(!driver.is_available().await);
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let dir = tempfile::tempdir().unwrap();
        let (binary, log) = fake_warp_cli(&dir, "echo 'Status update: Connected'");
        let driver = WarpDriver::new(binary);

        let mut handle = driver.connect(&spec()).await.unwrap();
        assert_eq!(handle.tunnel(), "warp-fallback");
        assert!(driver.is_alive(&mut handle).await);
        assert_eq!(calls(&log), vec!["--version", "disconnect", "connect", "status", "status"]);
    }

    #[tokio::test]
    async fn test_bring_up_timeout_cancels_session() {
        let dir = tempfile::tempdir().unwrap();
        let (binary, log) = fake_warp_cli(&dir, "echo 'Status update: Connecting'");
        let driver = WarpDriver::new(binary).with_bring_up_window(Duration::from_secs(1));

        let err = driver.connect(&spec()).await.unwrap_err();
        assert!(err.to_string().contains("WARP not connected"), "{err}");

        let seen = calls(&log);
        let connect = seen.iter().position(|c| c == "connect").unwrap();
        assert!(seen.iter().skip(connect).any(|c| c == "status"));
        assert_eq!(seen.last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test]
    async fn test_slow_status_counts_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (binary, _) = fake_warp_cli(&dir, "sleep 3; echo 'Status update: Connected'");
        let driver = WarpDriver::new(binary);

        let mut handle = DriverHandle::session("warp-fallback");
        assert!(driver.is_alive(&mut handle).await);
    }

    #[tokio::test]
    async fn test_reported_disconnect_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let (binary, _) = fake_warp_cli(&dir, "echo 'Status update: Disconnected'");
        let driver = WarpDriver::new(binary);

        let mut handle = DriverHandle::session("warp-fallback");
        assert!(!driver.is_alive(&mut handle).await);
    }
}
