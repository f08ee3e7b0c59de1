//! Astarte device transport - command line entry point

use astarte_transport::config::{Config, TransportConfig};
use astarte_transport::interface::Introspection;
use astarte_transport::observability::init_default_logging;
use astarte_transport::pairing::PairingClient;
use astarte_transport::transport::mqtt::RumqttcFactory;
use astarte_transport::transport::Transport;
use astarte_transport::PersistentCache;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Device-side Astarte transport
#[derive(Parser)]
#[command(name = "astarte-transport")]
#[command(about = "Pair with Astarte and keep an MQTT session to the broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hardware id, overriding the configuration file
    #[arg(long, env = "ASTARTE_HARDWARE_ID")]
    hardware_id: Option<String>,

    /// Directory of interface JSON files
    #[arg(long, value_name = "DIR")]
    interfaces: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transport until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print pairing and cache state
    Status,
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["astarte-transport.toml", "/etc/astarte/transport.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("Starting astarte-transport v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config.transport,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_transport(config, cli.hardware_id, cli.interfaces).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Status => print_status(&config, cli.hardware_id),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(Config::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(Config::load_from_file(&path)?);
        }
    }

    Err("no configuration file found, pass one with -c/--config".into())
}

fn resolve_hardware_id(
    config: &TransportConfig,
    cli: Option<String>,
) -> Result<String, Box<dyn std::error::Error>> {
    cli.or_else(|| config.hardware_id.clone())
        .ok_or_else(|| "no hardware id: set hardware_id or pass --hardware-id".into())
}

async fn run_transport(
    config: TransportConfig,
    hardware_id: Option<String>,
    interfaces: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let hardware_id = resolve_hardware_id(&config, hardware_id)?;
    let introspection = match interfaces {
        Some(dir) => Introspection::load_dir(&dir)?,
        None => {
            warn!("No interface directory given, announcing an empty introspection");
            Introspection::new()
        }
    };

    let transport = Transport::new(
        &config,
        &hardware_id,
        introspection,
        Arc::new(RumqttcFactory::default()),
    )?;
    let handle = transport.handle();
    let mut running = tokio::spawn(transport.run());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        result = &mut running => {
            return match result {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(e.into()),
            };
        }
    }

    handle.shutdown().await?;
    running.await??;
    info!("Transport stopped");
    Ok(())
}

fn handle_config_command(
    config: &TransportConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        let rendered = toml::to_string_pretty(&Config {
            transport: config.clone(),
        })?;
        println!("{rendered}");
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

fn print_status(
    config: &TransportConfig,
    hardware_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let hardware_id = resolve_hardware_id(config, hardware_id)?;
    let pairing = PairingClient::new(config, &hardware_id)?;

    println!("hardware id:     {hardware_id}");
    println!("credentials:     {}", pairing.credentials_dir().display());
    println!("pairing state:   {:?}", pairing.state());
    match pairing.certificate_info() {
        Ok(info) => {
            println!("client id:       {}", info.common_name);
            println!("certificate end: {}", info.not_after);
        }
        Err(_) => println!("certificate:     none"),
    }

    let cache = PersistentCache::open(&config.database_path())?;
    println!("cached properties: {}", cache.all_persistent_entries().len());
    println!("queued messages:   {}", cache.all_retry_ids().len());
    println!("stored messages:   {}", cache.durable_message_count());
    Ok(())
}
