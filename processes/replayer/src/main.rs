//! 'main' for the Agora session replayer

use agora_module_block_tracker::{BlockTracker, HeightIndex, RecentEvents, TrackerConfig};
use anyhow::Result;
use clap::Parser;
use config::{Config, Environment, File};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod playback;
mod recorded_client;
mod replayer_config;
mod session;

use crate::playback::Playback;
use crate::recorded_client::RecordedClient;
use crate::replayer_config::ReplayerConfig;
use crate::session::Session;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["replayer.toml".to_string()])]
    config: Vec<String>,

    /// Session file, overrides the configured one
    #[arg(long, value_name = "PATH")]
    session: Option<String>,
}

/// Log every ticker and height index change until both channels close
async fn report(mut events: watch::Receiver<RecentEvents>, mut heights: watch::Receiver<HeightIndex>) {
    loop {
        tokio::select! {
            changed = events.changed() => {
                if changed.is_err() {
                    break;
                }
                let rows = events.borrow_and_update().clone();
                match rows.first() {
                    Some(newest) => info!("Ticker: {} rows, newest {}", rows.len(), newest.key()),
                    None => info!("Ticker empty"),
                }
            }
            changed = heights.changed() => {
                if changed.is_err() {
                    break;
                }
                let index = heights.borrow_and_update().clone();
                info!("Height index: {} heights", index.heights());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG filters, INFO when unset
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default().with(fmt::layer().with_filter(filter)).init();

    info!("Agora session replayer");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file).required(false));
    }
    let config = builder.add_source(Environment::with_prefix("AGORA")).build()?;

    let cfg = ReplayerConfig::new(&config);
    let session = Session::load(args.session.as_deref().unwrap_or(&cfg.session))?;
    info!(
        "Loaded session: {} blocks, {} steps",
        session.blocks.len(),
        session.steps.len()
    );

    let (client, feeds) = RecordedClient::new(&session);
    let mut tracker = BlockTracker::spawn(client, TrackerConfig::try_load(&config)?);
    let reporter = tokio::spawn(report(
        tracker.recent_filtered_events(),
        tracker.height_index(),
    ));

    let playback = Playback::new(feeds, cfg.lookup_timeout);
    playback.run(&tracker, session.steps).await?;

    // Let pending fetches and fallbacks settle
    let outcome = tokio::select! {
        _ = tokio::time::sleep(cfg.linger) => Ok(()),
        result = tracker.wait() => result,
    };
    drop(playback);

    tracker.shutdown().await;
    reporter.abort();

    // Bye!
    info!("Exiting");
    Ok(outcome?)
}
