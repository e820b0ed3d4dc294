//! Transit monitor - main entry point
//!
//! `mqtt` runs the topic-rate sampler until SIGINT/SIGTERM. `pulsar` and
//! `gtfsrt` collect once and exit, meant to be run from a scheduler.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use transit_monitor::collectors::{GtfsrtPoller, PulsarCollector};
use transit_monitor::config::{ConfigError, MonitorConfig};
use transit_monitor::error::MonitorResult;
use transit_monitor::metrics::{AzureMonitorConfig, AzureMonitorEmitter, LogEmitter, MetricEmitter};
use transit_monitor::observability::init_default_logging;
use transit_monitor::sampler::TopicSupervisor;

/// Transit data pipeline monitor
#[derive(Parser)]
#[command(name = "transit-monitor")]
#[command(about = "Forwards MQTT, Pulsar and GTFS-RT health metrics to Azure Monitor")]
#[command(version)]
struct Cli {
    /// TOML configuration file; the environment is used when omitted
    #[arg(short, long, value_name = "FILE", env = "MONITOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample MQTT topic rates until terminated
    Mqtt,
    /// Send Pulsar topic stats once
    Pulsar,
    /// Send GTFS-RT feed stats once
    Gtfsrt,
    /// Validate configuration
    Config {
        /// Print the loaded configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting transit monitor v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Mqtt => run_mqtt(config).await,
        Commands::Pulsar => run_pulsar(config).await,
        Commands::Gtfsrt => run_gtfsrt(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<MonitorConfig, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            MonitorConfig::load_from_file(path)
        }
        None => MonitorConfig::from_env(),
    }
}

/// Log-only in debug mode, Azure Monitor otherwise
fn build_emitter(config: &MonitorConfig) -> MonitorResult<Arc<dyn MetricEmitter>> {
    if config.is_debug {
        info!("Debug mode, metrics are logged instead of sent");
        return Ok(Arc::new(LogEmitter));
    }
    let section = config.require_azure()?;
    let emitter = AzureMonitorEmitter::new(AzureMonitorConfig::from_section(section))?;
    Ok(Arc::new(emitter))
}

async fn run_mqtt(config: MonitorConfig) -> MonitorResult<()> {
    if config.mqtt.topics.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "No MQTT topics configured, set TOPIC1 or [[mqtt.topics]]".to_string(),
        )
        .into());
    }

    let emitter = build_emitter(&config)?;
    let supervisor = TopicSupervisor::from_config(&config, emitter);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = supervisor.run() => {}
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}

async fn run_pulsar(config: MonitorConfig) -> MonitorResult<()> {
    let section = config.require_pulsar()?.clone();
    let emitter = build_emitter(&config)?;
    let collector = PulsarCollector::new(section)?;
    collector.run(emitter.as_ref()).await;
    Ok(())
}

async fn run_gtfsrt(config: MonitorConfig) -> MonitorResult<()> {
    let urls = config.require_gtfsrt()?.urls.clone();
    let emitter = build_emitter(&config)?;
    let poller = GtfsrtPoller::new(urls)?;
    let sent = poller.run(emitter.as_ref()).await;
    info!("GTFS-RT metrics sent: {sent}");
    Ok(())
}

fn handle_config_command(config: &MonitorConfig, show: bool) -> MonitorResult<()> {
    if show {
        let mut printable = config.clone();
        if let Some(azure) = printable.azure.as_mut() {
            azure.client_secret = "***".to_string();
        }
        match toml::to_string_pretty(&printable) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Failed to render configuration: {e}"
                ))
                .into())
            }
        }
    }

    info!(
        topics = config.mqtt.topics.len(),
        pulsar = config.pulsar.is_some(),
        gtfsrt = config.gtfsrt.is_some(),
        "Configuration validation complete"
    );
    Ok(())
}
