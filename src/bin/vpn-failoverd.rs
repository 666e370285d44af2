//! VPN Failover Daemon (vpn-failoverd)
//!
//! Keeps the highest-priority healthy VPN tunnel active and fails over to
//! the next candidate when it stops passing health checks.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default configuration (/etc/vpn-failover/config.json)
//! sudo vpn-failoverd
//!
//! # Use another configuration file with verbose logging
//! sudo vpn-failoverd --config ./vpn-failover.toml --verbose
//! ```

use clap::Parser;
use libvpnfailover::config::{FailoverConfig, DEFAULT_CONFIG_PATH};
use libvpnfailover::error::FailoverResult;
use libvpnfailover::Supervisor;
use std::path::PathBuf;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// VPN Failover Daemon
#[derive(Parser, Debug)]
#[command(name = "vpn-failoverd")]
#[command(version)]
#[command(about = "VPN failover daemon - keeps the best healthy tunnel active", long_about = None)]
struct Args {
    /// Configuration file (JSON, or TOML when ending in .toml)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

/// Termination signals registered before the supervisor starts
struct Signals {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
}

impl Signals {
    fn register() -> FailoverResult<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Resolve on SIGTERM or SIGINT
    async fn terminated(mut self) {
        loop {
            tokio::select! {
                _ = self.sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    return;
                }
                _ = self.sigint.recv() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    return;
                }
                _ = self.sighup.recv() => {
                    info!("Received SIGHUP; configuration changes take effect on restart");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> FailoverResult<()> {
    let args = Args::parse();

    let config = FailoverConfig::load(&args.config);
    let log_level = match (&config, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => args.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        (Err(_), false) => args.log_level.clone().unwrap_or_else(|| "info".to_string()),
    };
    init_logging(&log_level);

    info!("Starting VPN Failover Daemon (vpn-failoverd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("✗ Failed to load {}: {}", args.config.display(), e);
            return Err(e);
        }
    };

    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        warn!("⚠️  Not running as root - tunnels and routes may fail to come up");
    }

    let supervisor = match Supervisor::from_config(config.clone()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("✗ Invalid configuration: {}", e);
            return Err(e);
        }
    };
    let signals = Signals::register()?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  VPN Failover Daemon is ready");
    info!("  Configuration: {}", args.config.display());
    info!("  Control socket: {}", config.control_socket.display());
    info!("  Tunnels (priority order):");
    let mut vpns: Vec<_> = config.vpns.iter().collect();
    vpns.sort_by_key(|v| v.priority);
    for vpn in vpns {
        let marker = if vpn.enabled { "•" } else { "◦" };
        info!("    {} {} ({}, priority {})", marker, vpn.name, vpn.vpn_type, vpn.priority);
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    supervisor.run(signals.terminated()).await?;

    info!("VPN Failover Daemon stopped");
    Ok(())
}

/// Initialize logging; `RUST_LOG` takes precedence over `level`
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vpn_failoverd={},libvpnfailover={}", level, level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}
