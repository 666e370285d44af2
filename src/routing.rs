//! Egress routing updates
//!
//! After a tunnel becomes active the host (and the container network
//! behind it) must route through it. The update itself lives outside this
//! crate; the controller only calls a [`RouteUpdater`] once per successful
//! activation and logs, never retries, a failure.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::FailoverConfig;
use crate::error::{FailoverError, FailoverResult};
use crate::tunnel::common;

const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RouteUpdater: Send + Sync {
    /// `tunnel` is now the preferred egress
    async fn on_activated(&self, tunnel: &str) -> FailoverResult<()>;
}

/// Records the routing change without touching the system
pub struct LogRouteUpdater {
    docker_network: String,
}

impl LogRouteUpdater {
    pub fn new(docker_network: impl Into<String>) -> Self {
        Self {
            docker_network: docker_network.into(),
        }
    }
}

#[async_trait]
impl RouteUpdater for LogRouteUpdater {
    async fn on_activated(&self, tunnel: &str) -> FailoverResult<()> {
        info!("Routing updated for {} on {}", tunnel, self.docker_network);
        Ok(())
    }
}

/// Runs `<hook> <tunnel> <docker_network>`
pub struct HookRouteUpdater {
    hook: PathBuf,
    docker_network: String,
    timeout: Duration,
}

impl HookRouteUpdater {
    pub fn new(hook: impl Into<PathBuf>, docker_network: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            docker_network: docker_network.into(),
            timeout: HOOK_TIMEOUT,
        }
    }
}

#[async_trait]
impl RouteUpdater for HookRouteUpdater {
    async fn on_activated(&self, tunnel: &str) -> FailoverResult<()> {
        let hook = self.hook.to_string_lossy();
        let output = common::run_command(&hook, &[tunnel, self.docker_network.as_str()], self.timeout).await?;

        if !output.status.success() {
            return Err(FailoverError::CommandFailed {
                cmd: format!("{} {} {}", hook, tunnel, self.docker_network),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Routing hook switched {} to {}", self.docker_network, tunnel);
        Ok(())
    }
}

/// Hook updater when `routing_hook` is configured, logging updater otherwise
pub fn route_updater_for(config: &FailoverConfig) -> Arc<dyn RouteUpdater> {
    match &config.routing_hook {
        Some(hook) => Arc::new(HookRouteUpdater::new(hook.clone(), config.docker_network.clone())),
        None => Arc::new(LogRouteUpdater::new(config.docker_network.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_receives_tunnel_and_network() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$1 $2\" > {}\n", out.display())).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let hook = HookRouteUpdater::new(&script, "vpn-network");
        hook.on_activated("backup").await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "backup vpn-network");
    }

    #[tokio::test]
    async fn test_hook_failure_is_reported() {
        let hook = HookRouteUpdater::new("false", "vpn-network");
        let err = hook.on_activated("backup").await.unwrap_err();
        assert!(matches!(err, FailoverError::CommandFailed { code: Some(1), .. }));
    }
}
