use crate::config::Config;
use crate::probe::Probe;
use crate::stats::EventMetrics;
use crate::targets::StaticTargets;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod flow;
mod probe;
mod protocol;
mod state;
mod stats;
mod targets;
mod transport;

use clap::{Parser, Subcommand};

const SINK_CHANNEL_LEN: usize = 1024;

/// UDP listener probe: counts in-order, lost and delayed packets from paired senders
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the probe
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: "config.toml".to_string(),
    }) {
        Commands::Run { config } => run_probe(&config).await,
        Commands::Validate { config } => validate_config(&config),
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("Probe: {} on port {}", cfg.probe.name, cfg.probe.port);
            info!("Targets: {}", cfg.targets.len());
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn run_probe(config_path: &str) -> anyhow::Result<()> {
    // 1. Load Config
    let config = Config::load(config_path)?;
    info!(
        "Starting probe {} on port {} ({} targets)",
        config.probe.name,
        config.probe.port,
        config.targets.len()
    );

    // 2. Bind
    let targets = Arc::new(StaticTargets::from_config(&config.targets));
    let probe = Probe::init(config.probe.clone(), targets)?;

    // 3. Metrics sink: one JSON line per record on stdout
    let (sink_tx, mut sink_rx) = mpsc::channel::<EventMetrics>(SINK_CHANNEL_LEN);
    let printer = tokio::spawn(async move {
        while let Some(em) = sink_rx.recv().await {
            match serde_json::to_string(&em) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode metrics: {}", e),
            }
        }
    });

    // 4. Run until signalled
    let cancel = CancellationToken::new();
    let probe_handle = tokio::spawn(probe.start(cancel.clone(), sink_tx));

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    cancel.cancel();

    probe_handle.await?;
    printer.await?;
    Ok(())
}
