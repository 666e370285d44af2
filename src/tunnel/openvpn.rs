use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info};

use crate::error::{FailoverError, FailoverResult};
use super::common;
use super::driver::{DriverHandle, TunnelDriver};
use super::spec::{TunnelKind, TunnelSpec};

/// Ceiling on how long `connect` waits for the process to prove it is running
pub const BRING_UP_WINDOW: Duration = Duration::from_secs(5);
/// Time between SIGTERM and SIGKILL on disconnect
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

const STDERR_TAIL: usize = 20;

/// OpenVPN driver: one supervised `openvpn` child per tunnel
pub struct OpenVpnDriver {
    binary: String,
    run_dir: PathBuf,
    log_dir: PathBuf,
    bring_up_window: Duration,
}

impl OpenVpnDriver {
    /// Create a new OpenVPN driver
    pub fn new(binary: impl Into<String>, run_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            run_dir: run_dir.into(),
            log_dir: log_dir.into(),
            bring_up_window: BRING_UP_WINDOW,
        }
    }

    /// Shorten the bring-up window. Never exceeds `BRING_UP_WINDOW`.
    pub fn with_bring_up_window(mut self, window: Duration) -> Self {
        self.bring_up_window = window.min(BRING_UP_WINDOW);
        self
    }

    fn pid_file(&self, tunnel: &str) -> PathBuf {
        self.run_dir.join(format!("openvpn-{}.pid", tunnel))
    }

    fn log_file(&self, tunnel: &str) -> PathBuf {
        self.log_dir.join(format!("openvpn-{}.log", tunnel))
    }

    /// Build OpenVPN command arguments from the tunnel spec
    fn build_command_args(&self, spec: &TunnelSpec) -> FailoverResult<Vec<String>> {
        let config_path = spec
            .connect_params
            .config_path
            .as_ref()
            .ok_or_else(|| FailoverError::connect(&spec.name, "OpenVPN tunnel has no config_path"))?;

        let mut args = vec![
            "--config".to_string(),
            config_path.to_string_lossy().to_string(),
        ];

        if let Some(auth_path) = &spec.connect_params.auth_path {
            args.push("--auth-user-pass".to_string());
            args.push(auth_path.to_string_lossy().to_string());
        }

        args.push("--log".to_string());
        args.push(self.log_file(&spec.name).to_string_lossy().to_string());
        args.push("--writepid".to_string());
        args.push(self.pid_file(&spec.name).to_string_lossy().to_string());

        Ok(args)
    }
}

/// Forward the child's stderr to the log, keeping the last lines for
/// error reporting if the process dies during bring-up
async fn drain_stderr(tunnel: String, stderr: ChildStderr) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tunnel::openvpn", "[{}] {}", tunnel, line);
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}

#[async_trait]
impl TunnelDriver for OpenVpnDriver {
    fn kind(&self) -> TunnelKind {
        TunnelKind::OpenVpn
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available(&self.binary).await
    }

    async fn connect(&self, spec: &TunnelSpec) -> FailoverResult<DriverHandle> {
        info!("Starting OpenVPN for {}", spec.name);

        let args = self.build_command_args(spec)?;

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FailoverError::connect(&spec.name, format!("Failed to start {}: {}", self.binary, e)))?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(spec.name.clone(), stderr)));

        // Running for the whole window counts as up; exiting inside it does not
        match tokio::time::timeout(self.bring_up_window, child.wait()).await {
            Err(_) => {
                let handle = DriverHandle::process(&spec.name, child, Some(self.pid_file(&spec.name)));
                info!("OpenVPN running for {} (PID: {:?})", spec.name, handle.pid());
                Ok(handle)
            }
            Ok(Ok(status)) => {
                let mut stderr = String::new();
                if let Some(task) = stderr_task {
                    if let Ok(Ok(lines)) = tokio::time::timeout(Duration::from_secs(1), task).await {
                        stderr = lines.join("\n");
                    }
                }
                Err(FailoverError::connect(
                    &spec.name,
                    format!("openvpn exited during bring-up ({}): {}", status, stderr.trim()),
                ))
            }
            Ok(Err(e)) => Err(FailoverError::connect(
                &spec.name,
                format!("Error waiting for openvpn: {}", e),
            )),
        }
    }

    async fn disconnect(&self, mut handle: DriverHandle) {
        info!("Stopping OpenVPN for {}", handle.tunnel());

        if let Some(mut child) = handle.take_child() {
            common::terminate_child(&mut child, DISCONNECT_GRACE).await;
        } else {
            debug!("OpenVPN handle for {} has no process", handle.tunnel());
        }

        if let Some(pid_file) = handle.pid_file() {
            common::delete_file_if_exists(pid_file).await;
        }
    }

    async fn is_alive(&self, handle: &mut DriverHandle) -> bool {
        match handle.child_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::spec::ConnectParams;
    use std::os::unix::fs::PermissionsExt;

    fn spec(config: Option<&str>, auth: Option<&str>) -> TunnelSpec {
        TunnelSpec {
            name: "primary".to_string(),
            kind: TunnelKind::OpenVpn,
            connect_params: ConnectParams {
                config_path: config.map(PathBuf::from),
                auth_path: auth.map(PathBuf::from),
            },
            priority: 1,
            index: 0,
            probe_target: "https://httpbin.org/ip".to_string(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            reconnect_delay: Duration::from_secs(60),
            enabled: true,
        }
    }

    fn fake_openvpn(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("openvpn");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_build_command_args() {
        let driver = OpenVpnDriver::new("openvpn", "/var/run", "/var/log");
        let args = driver
            .build_command_args(&spec(Some("/etc/openvpn/client/a.conf"), Some("/etc/openvpn/client/auth.conf")))
            .unwrap();
        assert_eq!(
            args,
            vec![
                "--config",
                "/etc/openvpn/client/a.conf",
                "--auth-user-pass",
                "/etc/openvpn/client/auth.conf",
                "--log",
                "/var/log/openvpn-primary.log",
                "--writepid",
                "/var/run/openvpn-primary.pid",
            ]
        );

        let args = driver.build_command_args(&spec(Some("/a.conf"), None)).unwrap();
        assert!(!args.contains(&"--auth-user-pass".to_string()));
        assert!(!args.contains(&"--daemon".to_string()));
    }

    #[test]
    fn test_missing_config_path_is_connect_error() {
        let driver = OpenVpnDriver::new("openvpn", "/var/run", "/var/log");
        let err = driver.build_command_args(&spec(None, None)).unwrap_err();
        assert!(matches!(err, FailoverError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_supervised_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_openvpn(&dir, "exec sleep 30");
        let driver = OpenVpnDriver::new(binary, dir.path(), dir.path())
            .with_bring_up_window(Duration::from_millis(300));

        let mut handle = driver.connect(&spec(Some("/a.conf"), None)).await.unwrap();
        assert!(handle.pid().is_some());
        assert!(driver.is_alive(&mut handle).await);

        driver.disconnect(handle).await;
    }

    #[tokio::test]
    async fn test_early_exit_is_connect_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_openvpn(&dir, "echo 'Options error: bad config' >&2; exit 1");
        let driver = OpenVpnDriver::new(binary, dir.path(), dir.path())
            .with_bring_up_window(Duration::from_secs(2));

        let err = driver.connect(&spec(Some("/a.conf"), None)).await.unwrap_err();
        match err {
            FailoverError::Connect { tunnel, reason } => {
                assert_eq!(tunnel, "primary");
                assert!(reason.contains("Options error"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bring_up_window_is_capped() {
        let driver = OpenVpnDriver::new("openvpn", "/run", "/log").with_bring_up_window(Duration::from_secs(60));
        assert_eq!(driver.bring_up_window, BRING_UP_WINDOW);
    }
}
