//! vfctl - VPN Failover Control Tool
//!
//! Operator interface for the vpn-failover service: live status over the
//! control socket, configuration inspection and editing, one-off probes and
//! systemd service control.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libvpnfailover::config::{FailoverConfig, DEFAULT_CONFIG_PATH, DEFAULT_CONTROL_SOCKET};
use libvpnfailover::control;
use libvpnfailover::health::{HttpProber, Prober};
use libvpnfailover::status::{format_uptime, StatusSnapshot};
use libvpnfailover::tunnel::common;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SERVICE_NAME: &str = "vpn-failover";
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vfctl")]
#[command(version)]
#[command(about = "VPN failover service control", long_about = None)]
#[command(after_help = "Examples:
  vfctl status            # Show live service status
  vfctl logs -f           # Follow service logs
  vfctl list              # List configured VPNs
  vfctl disable primary   # Disable a VPN (restart to apply)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Control socket (defaults to the one named in the configuration)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live service status
    Status,
    /// List configured VPNs
    List,
    /// Show current configuration
    Config,
    /// Open the configuration file in $EDITOR
    EditConfig,
    /// Enable a VPN
    Enable {
        /// Name of the VPN to enable
        name: String,
    },
    /// Disable a VPN
    Disable {
        /// Name of the VPN to disable
        name: String,
    },
    /// Run one health check against a VPN's check URL
    Probe {
        /// Name of the VPN whose health check to run
        name: String,
    },
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Ask the running service to shut down
    Shutdown,
    /// Start the service
    Start,
    /// Stop the service
    Stop,
    /// Restart the service
    Restart,
    /// Show service logs
    Logs {
        /// Follow logs in real-time
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Status => handle_status(&cli).await,
        Commands::List => handle_list(&cli),
        Commands::Config => handle_config(&cli),
        Commands::EditConfig => handle_edit_config(&cli).await,
        Commands::Enable { name } => handle_toggle(&cli, name, true),
        Commands::Disable { name } => handle_toggle(&cli, name, false),
        Commands::Probe { name } => handle_probe(&cli, name).await,
        Commands::InitConfig { force } => handle_init_config(&cli, *force),
        Commands::Shutdown => handle_shutdown(&cli).await,
        Commands::Start => systemctl("start", "Starting", "started").await,
        Commands::Stop => systemctl("stop", "Stopping", "stopped").await,
        Commands::Restart => systemctl("restart", "Restarting", "restarted").await,
        Commands::Logs { follow } => handle_logs(*follow).await,
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|ext| ext == "toml").unwrap_or(false)
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Configuration file not found: {}", path.display()))
}

/// Parse the file without validating, so broken entries can still be inspected
fn parse_config(path: &Path) -> Result<FailoverConfig> {
    let content = read_config_file(path)?;
    FailoverConfig::parse(&content, is_toml(path))
        .with_context(|| format!("Failed to read configuration {}", path.display()))
}

fn socket_path(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }
    parse_config(&cli.config)
        .map(|config| config.control_socket)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONTROL_SOCKET))
}

async fn handle_status(cli: &Cli) -> Result<()> {
    let socket = socket_path(cli);
    let snapshot = control::status(&socket)
        .await
        .context("Service status unavailable")?;
    print_status(&snapshot);
    Ok(())
}

fn print_status(snapshot: &StatusSnapshot) {
    let running = if snapshot.service_running { "running" } else { "stopping" };
    println!("Service Status: {}", running);

    match &snapshot.active {
        Some(active) => {
            println!("Active VPN: {} ({}, {})", active.name, active.kind, active.state);
            if let Some(uptime) = active.uptime_secs {
                println!("Uptime: {}", format_uptime(uptime));
            }
            println!("Failure count: {}", active.failure_count);
        }
        None => println!("Active VPN: none"),
    }

    println!();
    println!("{:<20} {:<8} {:<9} {:<14} {:<9} LAST CHECK", "NAME", "TYPE", "PRIORITY", "STATE", "FAILURES");
    for conn in &snapshot.connections {
        let state = if conn.enabled { conn.state.to_string() } else { "disabled".to_string() };
        let last_check = conn
            .last_health_check
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<8} {:<9} {:<14} {:<9} {}",
            conn.name,
            conn.kind.as_str(),
            conn.priority,
            state,
            format!("{}/{}", conn.failure_count, conn.max_failures),
            last_check
        );
    }
}

fn handle_list(cli: &Cli) -> Result<()> {
    let config = parse_config(&cli.config)?;

    println!("Configured VPNs:");
    println!("{}", "-".repeat(60));
    for vpn in &config.vpns {
        let status = if vpn.enabled { "✓ Enabled" } else { "✗ Disabled" };
        println!(
            "{:<20} {:<10} Priority: {:<3} {}",
            vpn.name,
            vpn.vpn_type.as_str(),
            vpn.priority,
            status
        );
    }
    Ok(())
}

fn handle_config(cli: &Cli) -> Result<()> {
    let content = read_config_file(&cli.config)?;
    let pretty = if is_toml(&cli.config) {
        let table: toml::Table = content.parse().context("Failed to read configuration")?;
        toml::to_string_pretty(&table)?
    } else {
        let value: serde_json::Value = serde_json::from_str(&content).context("Failed to read configuration")?;
        serde_json::to_string_pretty(&value)?
    };

    println!("Current Configuration:");
    println!("{}", pretty.trim_end());
    Ok(())
}

async fn handle_edit_config(cli: &Cli) -> Result<()> {
    if !cli.config.exists() {
        bail!("Configuration file not found: {}", cli.config.display());
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());
    let status = tokio::process::Command::new(&editor)
        .arg(&cli.config)
        .status()
        .await
        .with_context(|| format!("Failed to open editor '{}'", editor))?;
    if !status.success() {
        bail!("Editor '{}' exited with {}", editor, status);
    }

    println!("Configuration updated. Restart service to apply changes.");
    Ok(())
}

/// Flip `enabled` on one entry, leaving every other key as written
fn set_enabled(content: &str, toml_format: bool, name: &str, enabled: bool) -> Result<String> {
    if toml_format {
        let mut table: toml::Table = content.parse().context("Failed to read configuration")?;
        let vpn = table
            .get_mut("vpns")
            .and_then(|v| v.as_array_mut())
            .and_then(|vpns| {
                vpns.iter_mut()
                    .filter_map(|v| v.as_table_mut())
                    .find(|v| v.get("name").and_then(|n| n.as_str()) == Some(name))
            })
            .with_context(|| format!("VPN '{}' not found in configuration", name))?;
        vpn.insert("enabled".to_string(), toml::Value::Boolean(enabled));
        Ok(toml::to_string_pretty(&table)?)
    } else {
        let mut value: serde_json::Value = serde_json::from_str(content).context("Failed to read configuration")?;
        let vpn = value
            .get_mut("vpns")
            .and_then(|v| v.as_array_mut())
            .and_then(|vpns| {
                vpns.iter_mut()
                    .filter_map(|v| v.as_object_mut())
                    .find(|v| v.get("name").and_then(|n| n.as_str()) == Some(name))
            })
            .with_context(|| format!("VPN '{}' not found in configuration", name))?;
        vpn.insert("enabled".to_string(), serde_json::Value::Bool(enabled));
        Ok(serde_json::to_string_pretty(&value)? + "\n")
    }
}

fn handle_toggle(cli: &Cli, name: &str, enabled: bool) -> Result<()> {
    let content = read_config_file(&cli.config)?;
    let updated = set_enabled(&content, is_toml(&cli.config), name, enabled)?;
    std::fs::write(&cli.config, updated)
        .with_context(|| format!("Failed to update {}", cli.config.display()))?;

    let status = if enabled { "enabled" } else { "disabled" };
    println!("✓ VPN '{}' {}", name, status);
    println!("Restart service to apply changes");
    Ok(())
}

async fn handle_probe(cli: &Cli, name: &str) -> Result<()> {
    let config = parse_config(&cli.config)?;
    let spec = config
        .tunnel_specs()
        .into_iter()
        .find(|spec| spec.name == name)
        .with_context(|| format!("VPN '{}' not found in configuration", name))?;

    println!("Testing {} via {}", spec.name, spec.probe_target);
    let prober = HttpProber::new()?;
    match prober.probe(&spec.name, &spec.probe_target, spec.probe_timeout).await {
        Ok(()) => {
            println!("✓ Health check passed");
            Ok(())
        }
        Err(e) => bail!("✗ {}", e),
    }
}

fn handle_init_config(cli: &Cli, force: bool) -> Result<()> {
    if cli.config.exists() && !force {
        bail!(
            "Configuration file already exists: {} (use --force to overwrite)",
            cli.config.display()
        );
    }

    FailoverConfig::default_config()
        .save(&cli.config)
        .with_context(|| format!("Failed to write {}", cli.config.display()))?;
    println!("✓ Default configuration written to {}", cli.config.display());
    Ok(())
}

async fn handle_shutdown(cli: &Cli) -> Result<()> {
    let socket = socket_path(cli);
    control::shutdown(&socket).await.context("Shutdown request failed")?;
    println!("✓ Shutdown requested");
    Ok(())
}

async fn systemctl(action: &str, doing: &str, done: &str) -> Result<()> {
    println!("{} VPN failover service...", doing);
    common::run_checked("systemctl", &["--no-pager", action, SERVICE_NAME], SYSTEMCTL_TIMEOUT)
        .await
        .with_context(|| format!("✗ Failed to {} service", action))?;
    println!("✓ Service {} successfully", done);
    Ok(())
}

async fn handle_logs(follow: bool) -> Result<()> {
    let mut cmd = tokio::process::Command::new("journalctl");
    cmd.args(["--no-pager", "-u", SERVICE_NAME]);
    if follow {
        cmd.arg("--follow");
    } else {
        cmd.args(["-n", "50"]);
    }

    let status = cmd.status().await.context("Failed to run journalctl")?;
    if !status.success() {
        bail!("journalctl exited with {}", status);
    }
    Ok(())
}
