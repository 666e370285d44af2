//! Control socket for status queries and shutdown requests
//!
//! Unix domain socket speaking one JSON object per line in each direction.
//! Status is answered from the published snapshot, so a query never waits
//! on the failover lock.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{FailoverError, FailoverResult};
use crate::status::{StatusHandle, StatusSnapshot};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlRequest {
    Status,
    Shutdown,
}

/// Response messages from the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlResponse {
    Status(StatusSnapshot),
    Ok,
    Error { message: String },
}

pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
    status: StatusHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file left by a previous run
    pub fn bind(
        socket_path: impl AsRef<Path>,
        status: StatusHandle,
        shutdown_tx: watch::Sender<bool>,
    ) -> FailoverResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            FailoverError::Control(format!("Failed to bind {}: {}", socket_path.display(), e))
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Control socket listening on {}", socket_path.display());
        Ok(Self {
            socket_path,
            listener,
            status,
            shutdown_tx,
        })
    }

    /// Accept clients until shutdown is signalled
    pub async fn serve(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let status = self.status.clone();
                        let shutdown_tx = self.shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, status, shutdown_tx).await {
                                debug!("Control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Control socket accept error: {}", e),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Control socket closed");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    status: StatusHandle,
    shutdown_tx: watch::Sender<bool>,
) -> FailoverResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => handle_request(request, &status, &shutdown_tx),
        Err(e) => ControlResponse::Error {
            message: format!("Invalid request: {}", e),
        },
    };

    let mut response_json = serde_json::to_string(&response)?;
    response_json.push('\n');
    writer.write_all(response_json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn handle_request(
    request: ControlRequest,
    status: &StatusHandle,
    shutdown_tx: &watch::Sender<bool>,
) -> ControlResponse {
    match request {
        ControlRequest::Status => ControlResponse::Status(status.current()),
        ControlRequest::Shutdown => {
            info!("Shutdown requested over control socket");
            shutdown_tx.send_replace(true);
            ControlResponse::Ok
        }
    }
}

/// Send one request to a running daemon and wait for its answer
pub async fn request(socket_path: &Path, request: &ControlRequest) -> FailoverResult<ControlResponse> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        FailoverError::Control(format!(
            "Failed to connect to {}: {}. Is the service running?",
            socket_path.display(),
            e
        ))
    })?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut request_json = serde_json::to_string(request)?;
    request_json.push('\n');
    writer.write_all(request_json.as_bytes()).await?;
    writer.flush().await?;

    let mut line = String::new();
    tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| FailoverError::Timeout("waiting for control socket response".to_string()))??;

    Ok(serde_json::from_str(line.trim())?)
}

/// Fetch the daemon's current status snapshot
pub async fn status(socket_path: &Path) -> FailoverResult<StatusSnapshot> {
    match request(socket_path, &ControlRequest::Status).await? {
        ControlResponse::Status(snapshot) => Ok(snapshot),
        ControlResponse::Error { message } => Err(FailoverError::Control(message)),
        ControlResponse::Ok => Err(FailoverError::Control("Unexpected response".to_string())),
    }
}

/// Ask the daemon to shut down
pub async fn shutdown(socket_path: &Path) -> FailoverResult<()> {
    match request(socket_path, &ControlRequest::Shutdown).await? {
        ControlResponse::Ok => Ok(()),
        ControlResponse::Error { message } => Err(FailoverError::Control(message)),
        ControlResponse::Status(_) => Err(FailoverError::Control("Unexpected response".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            service_running: true,
            active: None,
            connections: vec![],
        }
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(serde_json::to_string(&ControlRequest::Status).unwrap(), r#"{"type":"status"}"#);
        assert_eq!(
            serde_json::from_str::<ControlRequest>(r#"{"type":"shutdown"}"#).unwrap(),
            ControlRequest::Shutdown
        );

        let json = serde_json::to_value(ControlResponse::Status(snapshot())).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["service_running"], true);
        assert_eq!(serde_json::to_string(&ControlResponse::Ok).unwrap(), r#"{"type":"ok"}"#);
    }

    #[tokio::test]
    async fn test_status_and_shutdown_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");

        let (_status_tx, status_rx) = watch::channel(snapshot());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = ControlServer::bind(&path, StatusHandle::new(status_rx), shutdown_tx).unwrap();
        let task = tokio::spawn(server.serve());

        let current = status(&path).await.unwrap();
        assert!(current.service_running);

        shutdown(&path).await.unwrap();
        shutdown_rx.changed().await.unwrap();
        assert!(*shutdown_rx.borrow());

        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalid_request_gets_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");

        let (_status_tx, status_rx) = watch::channel(snapshot());
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let server = ControlServer::bind(&path, StatusHandle::new(status_rx), shutdown_tx).unwrap();
        tokio::spawn(server.serve());

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"type\":\"reboot\"}\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let response: ControlResponse = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(response, ControlResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_request_without_server_is_control_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = status(&dir.path().join("missing.sock")).await.unwrap_err();
        assert!(matches!(err, FailoverError::Control(_)));
    }
}
