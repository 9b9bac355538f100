//! `roadwatch`: command-line client for the shared road marker map.
//!
//! Connects to the configured MQTT broker, mirrors the marker set locally and
//! lets the user announce or approve markers from the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roadwatch::config::{self, Config};
use roadwatch::marker::{Marker, MarkerType};
use roadwatch::position::{initial_viewport, FixedPosition, PositionProvider, UnavailablePosition};
use roadwatch::presentation::{self, MarkerListItem};
use roadwatch::store::{MarkerStore, StoreEvent};
use roadwatch::sync::{ApprovalOutcome, ConnectionState, SyncEngine};
use roadwatch::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "roadwatch", version, about = "Shared road marker map client")]
struct Cli {
    /// Config file (defaults to $ROADWATCH_CONFIG or the platform config dir)
    #[arg(long, short, global = true)]
    config: Option<String>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror the shared marker set and print changes until Ctrl+C
    Watch {
        /// Print markers as JSON lines
        #[arg(long)]
        json: bool,
        /// Dump prometheus counters on exit
        #[arg(long)]
        metrics: bool,
    },
    /// Announce a new marker
    Announce {
        #[command(flatten)]
        marker: MarkerArgs,
    },
    /// Approve an existing marker
    Approve {
        #[command(flatten)]
        marker: MarkerArgs,
        /// Current approval count of the marker
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the JSON schema of the config file
    Schema,
    /// Print the effective configuration as TOML
    Show,
}

#[derive(clap::Args, Debug)]
struct MarkerArgs {
    /// Location label
    #[arg(long)]
    address: String,
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// Category code: 0 safe, 1 hazard, 2 construction
    #[arg(long = "type", default_value_t = 1)]
    kind: i64,
}

impl MarkerArgs {
    fn to_marker(&self) -> Result<Marker> {
        let marker = Marker::new(
            self.address.clone(),
            self.lat,
            self.lon,
            MarkerType::from(self.kind),
        );
        if !marker.has_valid_coordinates() {
            anyhow::bail!("coordinates ({}, {}) are out of range", self.lat, self.lon);
        }
        Ok(marker)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Watch { json, metrics } => watch(config, json, metrics).await,
        Command::Announce { marker } => announce(config, marker.to_marker()?).await,
        Command::Approve { marker, count } => {
            approve(config, marker.to_marker()?.with_approve_count(count)).await
        }
        Command::Config { action } => match action {
            ConfigAction::Schema => {
                println!("{}", config::json_schema()?);
                Ok(())
            }
            ConfigAction::Show => {
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to render config")?;
                print!("{rendered}");
                Ok(())
            }
        },
    }
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "roadwatch=info",
        1 => "roadwatch=debug",
        _ => "roadwatch=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "mqtt")]
fn broker_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    let transport = roadwatch::transport::MqttTransport::new(config.broker.clone());
    tracing::debug!(client_id = transport.client_id(), "MQTT transport ready");
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "mqtt"))]
fn broker_transport(_config: &Config) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("roadwatch was built without the `mqtt` feature")
}

fn build_engine(config: &Config, store: Arc<MarkerStore>) -> Result<Arc<SyncEngine>> {
    SyncEngine::new(
        broker_transport(config)?,
        store,
        config.topics.clone(),
        config.sync.clone(),
    )
}

async fn connect(engine: &Arc<SyncEngine>) -> Result<()> {
    engine
        .start_with_backoff()
        .await
        .context("Failed to connect to broker")
}

async fn watch(config: Config, json: bool, dump_metrics: bool) -> Result<()> {
    let store = Arc::new(MarkerStore::new());
    let engine = build_engine(&config, store.clone())?;

    let provider: Box<dyn PositionProvider> = match FixedPosition::from_config(&config.position) {
        Some(fixed) => Box::new(fixed),
        None => Box::new(UnavailablePosition::default()),
    };
    if let Some(viewport) = initial_viewport(provider.as_ref()).await {
        tracing::info!(
            lat = viewport.latitude,
            lon = viewport.longitude,
            "Watching around configured position"
        );
    }

    let mut events = store.subscribe();
    connect(&engine).await?;
    let supervisor = tokio::spawn(supervise(
        engine.clone(),
        Duration::from_millis(config.sync.backoff.initial_ms),
    ));
    tracing::info!("Watching markers. Press Ctrl+C to stop.");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Upserted(marker)) => print_item(&MarkerListItem::from(&marker), json),
                Ok(StoreEvent::Removed(marker)) => {
                    tracing::info!(address = %marker.address, "Marker removed locally");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Display fell behind; reprinting snapshot");
                    for item in presentation::list_items(&store) {
                        print_item(&item, json);
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    supervisor.abort();
    engine.stop().await;
    if dump_metrics {
        print!("{}", engine.metrics().render());
    }
    Ok(())
}

/// Reconnect whenever the link drops, waiting `pause` first so a broker that
/// ends every session (e.g. by refusing our subscriptions) is not hammered.
async fn supervise(engine: Arc<SyncEngine>, pause: Duration) {
    let mut state = engine.watch_state();
    loop {
        if state.changed().await.is_err() {
            return;
        }
        let current = *state.borrow_and_update();
        if current != ConnectionState::Disconnected {
            continue;
        }
        tracing::warn!("Broker link down; reconnecting");
        tokio::time::sleep(pause).await;
        if let Err(e) = engine.start_with_backoff().await {
            tracing::error!("Giving up on broker: {e:#}");
            return;
        }
    }
}

fn print_item(item: &MarkerListItem, json: bool) {
    if json {
        match serde_json::to_string(item) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Failed to render marker: {e}"),
        }
    } else {
        println!(
            "[{}] {:<40} {:<12} {}",
            item.key.short(),
            item.title,
            item.icon.name(),
            item.description
        );
    }
}

async fn announce(config: Config, marker: Marker) -> Result<()> {
    let engine = build_engine(&config, Arc::new(MarkerStore::new()))?;
    connect(&engine).await?;
    let result = engine.announce(&marker).await;
    engine.stop().await;
    result.context("Failed to announce marker")?;
    println!("announced {} ({})", marker.address, marker.key().short());
    Ok(())
}

async fn approve(config: Config, marker: Marker) -> Result<()> {
    let store = Arc::new(MarkerStore::new());
    store.upsert(marker.clone());
    let engine = build_engine(&config, store)?;
    connect(&engine).await?;
    let outcome = engine.approve(&marker).await;
    engine.stop().await;
    match outcome {
        ApprovalOutcome::Published(sent) => {
            println!(
                "approved {} ({}), now {}",
                sent.address,
                sent.key().short(),
                presentation::approval_description(sent.approve_count)
            );
            Ok(())
        }
        ApprovalOutcome::RolledBack(_) => anyhow::bail!("broker did not accept the approval"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
