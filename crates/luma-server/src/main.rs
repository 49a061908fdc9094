//! Luma server binary
//!
//! Wires the components together: state store, device registry, script
//! executor, worker pool, event router, MQTT bus and scheduler. Two
//! subcommands: `run` starts the server, `discover` generates the device
//! inventory from the bus.

mod discover;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luma_bus::{BusConfig, MqttBus};
use luma_core::EventSink;
use luma_registry::DeviceRegistry;
use luma_router::EventRouter;
use luma_scheduler::{Scheduler, SchedulerConfig};
use luma_script::{ScriptExecutor, WorkerPool};
use luma_store::StateStore;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Worker count for script dispatch.
const WORKERS: usize = 10;

/// Task queue capacity; overflow drops tasks rather than blocking
/// producers.
const QUEUE_SIZE: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "luma-server", version)]
#[command(about = "Smart home automation server with Lua scripting")]
struct Cli {
    /// MQTT broker URL (tcp://host:port or ssl://host:port)
    #[arg(long, global = true, default_value = "tcp://localhost:1883")]
    broker: String,

    /// MQTT username
    #[arg(long, global = true)]
    user: Option<String>,

    /// MQTT password
    #[arg(long, global = true)]
    pass: Option<String>,

    /// Configuration directory
    #[arg(long, global = true, default_value = "./config")]
    config: PathBuf,

    /// State database file
    #[arg(long, global = true, default_value = "./data/state.db")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "error")]
    log_level: String,

    /// Latitude for sunrise/sunset events
    #[arg(long, global = true)]
    latitude: Option<f64>,

    /// Longitude for sunrise/sunset events
    #[arg(long, global = true)]
    longitude: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the automation server
    Run,
    /// Discover devices and generate the inventory
    Discover {
        /// Seconds to wait for the device list
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = Level::from_str(&cli.log_level).unwrap_or(Level::ERROR);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let result = match &cli.command {
        Command::Run => run(&cli).await,
        Command::Discover { timeout } => discover::run(&cli, Duration::from_secs(*timeout)).await,
    };

    if let Err(e) = result {
        error!("Fatal: {e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    info!("Starting Luma server");

    let inventory = luma_config::load_inventory(&cli.config)
        .context("loading device inventory; run `luma-server discover` first")?;

    let store = Arc::new(StateStore::open(&cli.db).context("opening state database")?);
    let registry = Arc::new(DeviceRegistry::new(inventory.devices));

    let executor = ScriptExecutor::new(store, registry.clone(), cli.config.clone());
    let pool = WorkerPool::start(executor.clone(), WORKERS, QUEUE_SIZE);
    let router = Arc::new(EventRouter::new(cli.config.clone(), pool.clone()));
    let sink: Arc<dyn EventSink> = router;
    executor.attach_event_sink(sink.clone());

    let coordinates = match (cli.latitude, cli.longitude) {
        (Some(latitude), Some(longitude)) => Some((latitude, longitude)),
        _ => {
            info!("No coordinates given, sunrise/sunset events disabled");
            None
        }
    };
    let scheduler = Scheduler::new(SchedulerConfig {
        events_dir: cli.config.join("events"),
        coordinates,
    });
    executor.attach_scheduler(scheduler.clone());
    scheduler.set_invoker(&executor.invoker_handle());

    let bus = MqttBus::connect(
        BusConfig {
            broker: cli.broker.clone(),
            client_id: format!("luma-server-{}", std::process::id()),
            username: cli.user.clone(),
            password: cli.pass.clone(),
            extra_topics: luma_bus::topics_from_tree(&cli.config),
        },
        registry.clone(),
        sink.clone(),
    )
    .await
    .context("connecting to MQTT broker")?;
    registry.attach_bus(bus.clone());

    scheduler.start(sink);
    info!("Server is running; press Ctrl+C to stop");

    shutdown_signal().await?;

    info!("Shutting down");
    scheduler.stop().await;
    pool.stop().await;
    bus.disconnect().await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("listening for Ctrl+C")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
