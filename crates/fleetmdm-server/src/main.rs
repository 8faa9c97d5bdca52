//! Command-line interface for the FleetMDM server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetmdm_core::config::env_vars;
use fleetmdm_devices::LoggingPushSender;
use fleetmdm_server::config::DEFAULT_CONFIG_FILE;
use fleetmdm_server::{MdmServer, ServerConfig};
use fleetmdm_storage::{spawn_blocking, Store};

/// FleetMDM - device enrollment and command delivery.
#[derive(Parser, Debug)]
#[command(name = "fleetmdm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Config file path.
    #[arg(short, long, global = true, env = env_vars::CONFIG_PATH)]
    config: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MDM services until Ctrl-C.
    Serve,
    /// Print the stored record for a device as JSON.
    Device {
        /// Device UDID.
        #[arg(long)]
        udid: String,
    },
    /// Print the pending commands for a device as JSON.
    Queue {
        /// Device UDID.
        #[arg(long)]
        udid: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // JSON logging for production/container environments
    let json_logging = env_vars::parsed::<bool>(env_vars::LOG_JSON).unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("fleetmdm=info")
            .add_directive(tracing::Level::INFO.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    let path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = ServerConfig::load(&path)?;

    match args.command {
        Command::Serve => run_server(config).await,
        Command::Device { udid } => show_device(config, &udid).await,
        Command::Queue { udid } => show_queue(config, &udid).await,
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = MdmServer::start(config, Arc::new(LoggingPushSender)).await?;
    tracing::info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

/// Read-only inspection opens the store directly so no consumer or wake runs.
async fn show_device(config: ServerConfig, udid: &str) -> Result<()> {
    let store = Store::open(&config.storage.path)?;
    let devices = store.devices();
    let key = udid.to_string();
    let record = spawn_blocking(move || devices.get(&key))
        .await?
        .ok_or_else(|| anyhow::anyhow!("device {} not found", udid))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn show_queue(config: ServerConfig, udid: &str) -> Result<()> {
    let store = Store::open(&config.storage.path)?;
    let queues = store.queues();
    let key = udid.to_string();
    let queue = spawn_blocking(move || queues.get(&key)).await?;
    let pending = queue
        .commands
        .iter()
        .map(|command| serde_json::from_slice::<serde_json::Value>(&command.payload))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "udid": udid,
            "in_flight": queue.in_flight_uuid(),
            "commands": pending,
        }))?
    );
    Ok(())
}
