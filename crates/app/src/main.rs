//! Coven - live mirror of a social deduction game
//!
//! Loads the game from the remote store, follows the change feed, and logs
//! roster, status and message changes until interrupted. With `--serve` it
//! also hosts the feed relay for an in-process store.

use std::path::PathBuf;

use clap::Parser;
use coven_app::{Config, Engine, PhaseTransition};
use coven_core::{MemoryStore, RemoteStore, RestStore};
use coven_net::{FeedHub, FeedTransport, LocalFeed, RelayServer, TcpFeed};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Config file (defaults to coven.toml in the platform config directory)
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Run against an in-process store and feed
    #[clap(long)]
    local: bool,
    /// Serve an in-process store's changes on the relay address
    #[clap(long, conflicts_with = "local")]
    serve: bool,
    /// Feed relay address, overrides the config file
    #[clap(short, long)]
    relay: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(relay) = args.relay {
        config.feed.relay = relay;
    }

    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Starting Coven");

    let names = config.feed.channel_names();
    if args.serve {
        let store = MemoryStore::new();
        let relay = RelayServer::start(config.feed.relay_addr()?, FeedHub::new()).await?;
        let _forwarder = relay.hub().forward(store.subscribe_changes());
        let feed = LocalFeed::new(relay.hub().clone());
        run(Engine::with_channels(store, feed, names)).await;
        relay.shutdown();
    } else if args.local {
        let store = MemoryStore::new();
        let feed = LocalFeed::new(FeedHub::new());
        let _forwarder = feed.hub().forward(store.subscribe_changes());
        run(Engine::with_channels(store, feed, names)).await;
    } else {
        let store = RestStore::new(config.store.url.clone(), config.store.api_key.clone());
        let feed = TcpFeed::connect(config.feed.relay_addr()?).await?;
        run(Engine::with_channels(store, feed.clone(), names)).await;
        feed.disconnect().await;
    }

    Ok(())
}

async fn run<S: RemoteStore, T: FeedTransport>(engine: Engine<S, T>) {
    let mut transitions = engine.subscribe_transitions();
    let mut views = engine.views();

    if let Err(e) = engine.initialize().await {
        tracing::error!("Initial load failed: {}", e);
    }
    log_snapshot(&views);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            transition = transitions.recv() => match transition {
                Ok(PhaseTransition { old_phase, new_phase, status }) => {
                    tracing::info!(
                        "Phase {} -> {} ({}, day {})",
                        old_phase, new_phase, status.current_phase, status.day_number
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Missed phase transitions");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = engine.reconnected() => {
                // Changes made while the feed was down were never delivered
                if let Err(e) = engine.refresh().await {
                    tracing::warn!("Resync after reconnect failed: {}", e);
                }
            }
            alive = views.changed() => {
                if !alive {
                    break;
                }
                log_snapshot(&views);
            }
        }
    }

    engine.cleanup().await;
}

fn log_snapshot(views: &coven_app::Views) {
    let derived = views.derived();
    tracing::info!(
        connectivity = ?views.connectivity(),
        phase = %derived.phase,
        players = views.participants().len(),
        alive = derived.alive.len(),
        cult = derived.factions.cult.len(),
        townsfolk = derived.factions.townsfolk.len(),
        messages = views.messages().len(),
        "Game state"
    );
    if let Some(last) = views.messages().back() {
        tracing::debug!("[{}] {}: {}", last.format_timestamp(), last.author_name, last.content);
    }
}
