//! Common helpers shared by the tunnel drivers

use crate::error::{FailoverError, FailoverResult};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which")
        .arg(binary)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Get the version of a binary by running it with --version
pub async fn get_binary_version(binary: &str) -> FailoverResult<String> {
    let output = run_command(binary, &["--version"], Duration::from_secs(5)).await?;

    if !output.status.success() {
        return Err(FailoverError::CommandFailed {
            cmd: format!("{} --version", binary),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    Ok(version_output.lines().next().unwrap_or("unknown").to_string())
}

/// Run a command to completion, giving up after `limit`.
///
/// The child is killed when the limit expires.
pub async fn run_command(binary: &str, args: &[&str], limit: Duration) -> FailoverResult<Output> {
    let cmd = format!("{} {}", binary, args.join(" "));
    let child = Command::new(binary)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FailoverError::CommandFailed {
            cmd: cmd.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => {
            let output = result?;
            debug!("'{}' exited with {}", cmd, output.status);
            Ok(output)
        }
        Err(_) => Err(FailoverError::Timeout(format!("'{}' did not finish within {:?}", cmd, limit))),
    }
}

/// Like `run_command`, but a non-zero exit becomes `CommandFailed`
pub async fn run_checked(binary: &str, args: &[&str], limit: Duration) -> FailoverResult<String> {
    let output = run_command(binary, args, limit).await?;
    if !output.status.success() {
        return Err(FailoverError::CommandFailed {
            cmd: format!("{} {}", binary, args.join(" ")),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Ask a child process to exit with SIGTERM, then SIGKILL it if it is
/// still running after `grace`.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    #[cfg(unix)]
    {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!("Failed to send SIGTERM to {}: {}", pid, std::io::Error::last_os_error());
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Process {} exited with status: {}", pid, status);
        }
        Ok(Err(e)) => {
            warn!("Error waiting for process {}: {}", pid, e);
        }
        Err(_) => {
            warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process {}: {}", pid, e);
            }
        }
    }
}

/// Delete a file if it exists
pub async fn delete_file_if_exists(path: &Path) {
    if path.exists() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Deleted {:?}", path),
            Err(e) => warn!("Failed to delete {:?}: {}", path, e),
        }
    }
}
