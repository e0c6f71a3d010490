// dmxnode binary entry point

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dmxnode::config::{Config, SharedConfig};
use dmxnode::snapshot::FileSnapshotStore;
use dmxnode::{CoreOptions, DmxCore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional JSON config file as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("loading config from {}", path);
            serde_json::from_str::<Config>(&std::fs::read_to_string(path)?)?
        }
        None => Config::default(),
    };

    let source = Arc::new(SharedConfig::new(config));
    let options = CoreOptions {
        snapshot_store: Box::new(FileSnapshotStore::new("snapshots")),
        ..CoreOptions::default()
    };

    let core = DmxCore::start(source, options).await?;
    info!("dmxnode started - listening for Art-Net and sACN traffic");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    core.stop().await;
    Ok(())
}
