use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;

use crate::error::FailoverResult;
use super::spec::{TunnelKind, TunnelSpec};

/// Ownership of whatever keeps a tunnel up: a child process, a daemon
/// session, or both. Exclusively owned by its `Connection` while the
/// connection is connecting, connected or disconnecting.
#[derive(Debug)]
pub struct DriverHandle {
    tunnel: String,
    child: Option<Child>,
    pid_file: Option<PathBuf>,
}

impl DriverHandle {
    /// Handle for a tunnel held by an external daemon (no local process)
    pub fn session(tunnel: &str) -> Self {
        Self {
            tunnel: tunnel.to_string(),
            child: None,
            pid_file: None,
        }
    }

    /// Handle for a tunnel backed by a supervised child process
    pub fn process(tunnel: &str, child: Child, pid_file: Option<PathBuf>) -> Self {
        Self {
            tunnel: tunnel.to_string(),
            child: Some(child),
            pid_file,
        }
    }

    pub fn tunnel(&self) -> &str {
        &self.tunnel
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }
}

/// Common interface every tunnel technology implements.
///
/// Implementations bound all of their waits: `connect` gives up after a
/// fixed bring-up window, `disconnect` force-terminates after a fixed grace
/// window, and `is_alive` never waits on the network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Technology served by this driver
    fn kind(&self) -> TunnelKind;

    /// Check if the tunnel software is installed
    async fn is_available(&self) -> bool;

    /// Bring the tunnel up and return a live handle, or a `Connect` error
    async fn connect(&self, spec: &TunnelSpec) -> FailoverResult<DriverHandle>;

    /// Tear the tunnel down. Best-effort: failures are logged, never returned.
    async fn disconnect(&self, handle: DriverHandle);

    /// Cheap liveness check of the underlying mechanism
    async fn is_alive(&self, handle: &mut DriverHandle) -> bool;
}

/// Registered drivers, one per tunnel kind
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<TunnelKind, Arc<dyn TunnelDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous driver for the same kind
    pub fn register(&mut self, driver: Arc<dyn TunnelDriver>) {
        tracing::info!("Registering tunnel driver: {}", driver.kind());
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: TunnelKind) -> Option<Arc<dyn TunnelDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn has_driver(&self, kind: TunnelKind) -> bool {
        self.drivers.contains_key(&kind)
    }
}
