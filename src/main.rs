use anyhow::{Context, Result};
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use globalchat::bot::shutdown::{self, ShutdownConfig};
use globalchat::platforms::{AttachmentFetcher, ImageClassifier};
use globalchat::prelude::*;

const DEFAULT_CONFIG_PATH: &str = "globalchat.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting GlobalChat relay v{}", env!("CARGO_PKG_VERSION"));

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("GLOBALCHAT_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = RelayConfig::load_or_create(&config_path)
        .await
        .with_context(|| format!("loading configuration from {}", config_path))?;
    config.apply_env_overrides();
    config.validate()?;
    info!("Configuration loaded from {}", config_path);

    let store = Arc::new(
        FileStore::open(&config.storage.data_dir)
            .await
            .with_context(|| format!("opening data directory {}", config.storage.data_dir.display()))?,
    );

    let transport = Arc::new(LoggingTransport::new());
    let fetcher: Arc<dyn AttachmentFetcher> = Arc::new(HttpAttachmentFetcher::new(config.classifier.timeout())?);
    let classifier: Option<Arc<dyn ImageClassifier>> = match config.classifier.endpoint.as_deref() {
        Some(endpoint) => Some(Arc::new(HttpClassifier::new(endpoint, config.classifier.timeout())?)),
        None => {
            warn!("No classifier endpoint configured");
            None
        }
    };

    let collaborators = Collaborators {
        registry: store.clone(),
        bans: store.clone(),
        audit: store.clone(),
        notifier: transport.clone(),
        sender: transport,
        fetcher,
        classifier,
    };

    let engine = Arc::new(GlobalChat::new(config, collaborators).await?);
    engine.start().await?;

    let shutdown_manager = shutdown::setup(Arc::clone(&engine), ShutdownConfig::default()).await;

    let (message_tx, message_rx) = broadcast::channel(1024);
    let relay_engine = Arc::clone(&engine);
    let relay_shutdown = Arc::clone(&shutdown_manager);
    let relay = tokio::spawn(async move {
        relay_engine.relay_until_closed(message_rx, relay_shutdown).await;
    });

    // One JSON-encoded message per line on stdin; closing it ends the relay
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<RelayMessage>(&line) {
                    Ok(message) => {
                        if message_tx.send(message).is_err() {
                            warn!("Message processor is gone, dropping input");
                            break;
                        }
                    }
                    Err(e) => warn!("Skipping malformed message: {}", e),
                },
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }
        drop(message_tx);
    });

    info!("GlobalChat relay running, reading messages from stdin");

    if let Err(e) = shutdown_manager.wait_for_shutdown().await {
        error!("Error during shutdown: {}", e);
    }
    relay.abort();

    let stats = shutdown_manager.get_stats().await;
    if !stats.failed_components.is_empty() {
        warn!("Components failed to stop cleanly: {:?}", stats.failed_components);
    }

    info!("GlobalChat relay stopped");
    Ok(())
}
