//! Error types for vpn-failover

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FailoverError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Malformed or missing configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),
    /// A driver could not bring a tunnel up
    #[error("Failed to connect '{tunnel}': {reason}")]
    Connect { tunnel: String, reason: String },
    /// A connectivity probe through the active tunnel failed
    #[error("Probe failed for '{tunnel}': {reason}")]
    Probe { tunnel: String, reason: String },
    /// Every enabled tunnel is failed or cooling down
    #[error("No tunnel candidate available")]
    NoCandidateAvailable,
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Control socket error
    #[error("Control socket error: {0}")]
    Control(String),
    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl FailoverError {
    pub fn connect(tunnel: &str, reason: impl Into<String>) -> Self {
        FailoverError::Connect { tunnel: tunnel.to_string(), reason: reason.into() }
    }

    pub fn probe(tunnel: &str, reason: impl Into<String>) -> Self {
        FailoverError::Probe { tunnel: tunnel.to_string(), reason: reason.into() }
    }
}

impl From<serde_json::Error> for FailoverError {
    fn from(error: serde_json::Error) -> Self {
        FailoverError::Parse(error.to_string())
    }
}

impl From<toml::de::Error> for FailoverError {
    fn from(error: toml::de::Error) -> Self {
        FailoverError::Config(error.to_string())
    }
}

pub type FailoverResult<T> = Result<T, FailoverError>;
