use std::sync::Arc;

use alloy_provider::{ProviderBuilder, WsConnect};
use anyhow::{Context, Result, anyhow};
use tokio::{signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};
use url::Url;

use rewards_indexer::indexer::log_processor::{BlockWindow, ContractTarget, LogProcessor};
use rewards_indexer::indexer::registry::EventRegistry;
use rewards_indexer::indexer::rpc::{AlloyChainClient, ChainClient};
use rewards_indexer::metrics::Metrics;
use rewards_indexer::storage::memory::MemoryStore;
use rewards_indexer::storage::setup_channels;
use rewards_indexer::utils::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Load config
    let config = match load_config("config.yml") {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {:#}", e);
            return Err(anyhow!(e));
        }
    };

    // A bad ABI is a deployment error, never a per-log skip
    let registry = EventRegistry::global().map_err(|e| {
        error!("Failed to build event registry: {}", e);
        anyhow!(e)
    })?;

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Metrics::new(config.chain_name.clone())?;
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Create RPC client. A websocket endpoint also enables live subscriptions.
    let client: Arc<dyn ChainClient> = match &config.ws_url {
        Some(ws_url) => {
            info!("WS URL: {}", ws_url);
            let provider = ProviderBuilder::new()
                .connect_ws(WsConnect::new(ws_url.as_str()))
                .await
                .context("failed to connect websocket provider")?;
            Arc::new(AlloyChainClient::new(provider, &config.rpc, metrics.clone()))
        }
        None => {
            let rpc_url: Url = config.rpc_url.parse().context("invalid rpc_url")?;
            info!("RPC URL: {}", rpc_url);
            let provider = ProviderBuilder::new().connect_http(rpc_url);
            Arc::new(AlloyChainClient::new(provider, &config.rpc, metrics.clone()))
        }
    };

    let targets = config
        .contracts
        .iter()
        .map(|contract| ContractTarget::from_config(contract, registry))
        .collect::<Result<Vec<_>, _>>()?;
    info!("Loaded {} contract targets", targets.len());

    // Set up storage and the workers that batch records into it
    let store = Arc::new(MemoryStore::new());
    let channels = setup_channels(store).await?;

    // Stop processing on Ctrl+C. Storage is flushed once the processor returns.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            info!("Received Ctrl+C signal, initiating shutdown...");
            let _ = stop_tx.send(true);
        }
    });

    let processor = LogProcessor::new(
        client,
        registry,
        targets,
        config.pipeline.clone(),
        metrics.clone(),
    );
    processor.validate_targets().await?;

    println!();
    info!("========================= STARTING INDEXER =========================");
    info!("Starting block number: {}", config.start_block);

    let follow = config.ws_url.is_some() && config.end_block.is_none();
    let window = BlockWindow {
        start_block: config.start_block,
        end_block: config.end_block,
        block_range: config.block_range,
        chain_tip_buffer: config.chain_tip_buffer,
    };

    let result = if follow {
        processor
            .follow(&channels, config.start_block, config.block_range, &mut stop_rx)
            .await
    } else {
        processor
            .backfill(&channels, window, &mut stop_rx)
            .await
            .map(|next_block| info!("Next unprocessed block: {}", next_block))
    };

    if let Err(e) = &result {
        error!("Indexer stopped with error: {:#}", e);
    }

    info!("Shutting down storage workers...");
    channels.shutdown().await?;

    result
}
