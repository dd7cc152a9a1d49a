use anyhow::Context;
use clap::{Parser, Subcommand};
use mvirt_relay::config::ConfigDocument;
use mvirt_relay::control::{self, Command};
use mvirt_relay::daemon::{CONFIG_PATH, CONTROL_PATH, Daemon, DaemonOptions};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-relay")]
#[command(about = "DHCPv4/DHCPv6 relay agent and UDP broadcast forwarder")]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Control socket of the running daemon
    #[arg(long, default_value = CONTROL_PATH, global = true)]
    control: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the relay daemon (default)
    Run {
        /// Configuration file
        #[arg(long, default_value = CONFIG_PATH)]
        config: PathBuf,
    },
    /// Show the DHCPv4 relay and UDP forwarder servers
    Dump {
        #[arg(long)]
        interface: Option<String>,
        /// Only show servers for this UDP port (requires --interface)
        #[arg(long, requires = "interface")]
        port: Option<u16>,
    },
    /// Show the DHCPv6 relay servers
    Dump6 {
        #[arg(long)]
        interface: Option<String>,
    },
    /// Show relay counters as JSON
    Stats,
    /// Parse and validate a configuration file without applying it
    CheckConfig { path: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let command = args.command.unwrap_or(Cmd::Run {
        config: PathBuf::from(CONFIG_PATH),
    });

    let result = match command {
        Cmd::Run { config } => run(config, args.control).await,
        Cmd::Dump { interface, port } => query(&args.control, Command::Dump { interface, port }).await,
        Cmd::Dump6 { interface } => query(&args.control, Command::Dump6 { interface }).await,
        Cmd::Stats => query(&args.control, Command::Stats).await,
        Cmd::CheckConfig { path } => check_config(&path),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "mvirt-relay failed");
        std::process::exit(1);
    }
}

async fn run(config_path: PathBuf, control_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "Starting mvirt-relay");

    let options = DaemonOptions {
        config_path,
        control_path,
    };
    let mut daemon = Daemon::start(&options)
        .context("Failed to start relay (root privileges are required for raw sockets)")?;

    let mut sighup = signal(SignalKind::hangup()).context("Failed to set up SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match daemon.reload() {
                    Ok(report) => info!(
                        changes = report.changes.len(),
                        skipped = report.skipped.len(),
                        toggles = report.toggles_changed,
                        "Configuration reloaded"
                    ),
                    Err(e) => error!(error = %e, "Configuration rejected"),
                }
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    daemon.shutdown();
    Ok(())
}

async fn query(control_path: &Path, command: Command) -> anyhow::Result<()> {
    let reply = control::request(control_path, &command)
        .await
        .with_context(|| format!("Failed to reach relay at {}", control_path.display()))?;
    print!("{reply}");
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let doc = ConfigDocument::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    doc.validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    println!(
        "{}: OK ({} interfaces)",
        path.display(),
        doc.interfaces.len()
    );
    Ok(())
}
