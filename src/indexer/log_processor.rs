use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::{Context, Result, anyhow, bail};
use futures::{StreamExt, stream};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::indexer::registry::EventRegistry;
use crate::indexer::rpc::ChainClient;
use crate::indexer::{ProcessedBatch, process_logs};
use crate::metrics::Metrics;
use crate::models::common::{ContractConfig, EventFamily, PipelineConfig};
use crate::models::datasets::logs::{EventDefinition, RawLog};
use crate::models::errors::RegistryError;
use crate::storage::RecordChannels;

const SLEEP_DURATION: Duration = Duration::from_millis(1000);
// Logs handed to the pipeline at once while following subscriptions
const FOLLOW_CHUNK_SIZE: usize = 64;

/// One configured contract and the events subscribed on it.
#[derive(Debug, Clone)]
pub struct ContractTarget {
    pub address: Address,
    pub family: EventFamily,
    pub definitions: Vec<EventDefinition>,
}

impl ContractTarget {
    pub fn from_config(
        contract: &ContractConfig,
        registry: &EventRegistry,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            address: contract.address,
            family: contract.family,
            definitions: contract.event_definitions(registry)?,
        })
    }
}

/// Block window walked by a backfill.
#[derive(Debug, Clone, Copy)]
pub struct BlockWindow {
    pub start_block: u64,
    /// Stop here instead of tailing the chain.
    pub end_block: Option<u64>,
    pub block_range: u64,
    pub chain_tip_buffer: u64,
}

/// Feeds logs of the configured contracts through the pipeline and hands
/// the records to storage.
pub struct LogProcessor<'r, C: ChainClient + ?Sized> {
    client: Arc<C>,
    registry: &'r EventRegistry,
    targets: Vec<ContractTarget>,
    pipeline: PipelineConfig,
    metrics: Option<Metrics>,
}

impl<'r, C: ChainClient + ?Sized> LogProcessor<'r, C> {
    pub fn new(
        client: Arc<C>,
        registry: &'r EventRegistry,
        targets: Vec<ContractTarget>,
        pipeline: PipelineConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            client,
            registry,
            targets,
            pipeline,
            metrics,
        }
    }

    pub fn targets(&self) -> &[ContractTarget] {
        &self.targets
    }

    /// Fails if a configured address has no deployed code.
    pub async fn validate_targets(&self) -> Result<()> {
        for target in &self.targets {
            let deployed = self
                .client
                .is_contract(target.address)
                .await
                .with_context(|| format!("failed to check code at {}", target.address))?;
            if !deployed {
                bail!("configured address {} is not a contract", target.address);
            }
        }
        Ok(())
    }

    async fn run_pipeline(&self, target: &ContractTarget, logs: &[RawLog]) -> Result<ProcessedBatch> {
        let family = self
            .registry
            .family(target.family)
            .ok_or_else(|| anyhow!("no registry entry for family {}", target.family))?;

        Ok(process_logs(
            self.client.as_ref(),
            family,
            logs,
            &target.definitions,
            &self.pipeline,
            self.metrics.as_ref(),
        )
        .await)
    }

    /// Fetches and processes one contract's logs in `[from_block, to_block]`.
    pub async fn process_range(
        &self,
        target: &ContractTarget,
        from_block: u64,
        to_block: u64,
    ) -> Result<ProcessedBatch> {
        let logs = self
            .client
            .filter_logs(target.address, from_block, to_block)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch logs for {} in blocks {}-{}",
                    target.address, from_block, to_block
                )
            })?;

        debug!(
            "Fetched {} logs for {} in blocks {}-{}",
            logs.len(),
            target.address,
            from_block,
            to_block
        );
        self.run_pipeline(target, &logs).await
    }

    async fn process_chunk(
        &self,
        channels: &RecordChannels,
        from_block: u64,
        to_block: u64,
    ) -> Result<()> {
        for target in &self.targets {
            let batch = self.process_range(target, from_block, to_block).await?;
            info!(
                "Blocks {}-{} for {}: {} event logs, {} user actions, {} diagnostics",
                from_block,
                to_block,
                target.address,
                batch.event_logs.len(),
                batch.action_count(),
                batch.diagnostics.len()
            );
            channels.send_batch(batch, to_block).await?;
        }
        Ok(())
    }

    /// Walks the window in `block_range` chunks, staying `chain_tip_buffer`
    /// blocks behind the tip. Without an end block it keeps tailing the chain
    /// until `stop` turns true. Returns the next unprocessed block.
    pub async fn backfill(
        &self,
        channels: &RecordChannels,
        window: BlockWindow,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<u64> {
        let block_range = window.block_range.max(1);
        let mut next_block = window.start_block;

        loop {
            // Check for shutdown signal (non-blocking)
            if *stop.borrow() {
                info!("Stopping backfill at block {}", next_block);
                return Ok(next_block);
            }

            if let Some(end_block) = window.end_block {
                if next_block > end_block {
                    info!("Backfill reached end block {}", end_block);
                    return Ok(next_block);
                }
            }

            let latest_block = self
                .client
                .latest_block_number()
                .await
                .context("failed to get latest block number")?;
            let safe_block = latest_block.saturating_sub(window.chain_tip_buffer);
            let last_block = window
                .end_block
                .map_or(safe_block, |end_block| end_block.min(safe_block));

            // If the indexer gets too close to the tip, back off and retry
            if next_block > last_block {
                debug!(
                    "Buffer limit reached. Waiting for block {} to be {} blocks behind tip {}",
                    next_block, window.chain_tip_buffer, latest_block
                );
                tokio::time::sleep(SLEEP_DURATION).await;
                continue;
            }

            // Check channel capacity and apply backpressure if needed
            while !channels.check_capacity(self.metrics.as_ref()).await {
                info!("Applying backpressure - sleeping for {:?}...", SLEEP_DURATION);
                tokio::time::sleep(SLEEP_DURATION).await;
            }

            let chunk_start = Instant::now();
            let chunk_end = next_block.saturating_add(block_range - 1).min(last_block);
            self.process_chunk(channels, next_block, chunk_end).await?;
            debug!(
                "Processed blocks {}-{} in {:?}",
                next_block,
                chunk_end,
                chunk_start.elapsed()
            );

            self.record_progress(chunk_end, latest_block);
            next_block = chunk_end + 1;
        }
    }

    /// Processes logs pushed by live subscriptions on every target. Blocks
    /// from `start_block` up to the tip at subscription time are fetched
    /// first so nothing between backfill and subscription is missed.
    pub async fn follow(
        &self,
        channels: &RecordChannels,
        start_block: u64,
        block_range: u64,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut subscriptions = Vec::with_capacity(self.targets.len());
        for (index, target) in self.targets.iter().enumerate() {
            let subscription = self
                .client
                .subscribe_logs(target.address)
                .await
                .with_context(|| format!("failed to subscribe to logs of {}", target.address))?;
            subscriptions.push(subscription.map(move |log| (index, log)).boxed());
            info!("Subscribed to logs of {} ({})", target.address, target.family);
        }

        let caught_up_to = self
            .client
            .latest_block_number()
            .await
            .context("failed to get latest block number")?;
        if start_block <= caught_up_to {
            let window = BlockWindow {
                start_block,
                end_block: Some(caught_up_to),
                block_range,
                chain_tip_buffer: 0,
            };
            self.backfill(channels, window, stop).await?;
        }
        if *stop.borrow() {
            info!("Stopped before following log subscriptions");
            return Ok(());
        }

        let mut incoming = stream::select_all(subscriptions).ready_chunks(FOLLOW_CHUNK_SIZE);
        loop {
            tokio::select! {
                chunk = incoming.next() => {
                    let Some(chunk) = chunk else {
                        warn!("All log subscriptions closed");
                        return Ok(());
                    };
                    self.process_pushed(channels, chunk, caught_up_to).await?;
                }
                // Disabled if the sender is dropped without stopping
                Ok(_) = stop.wait_for(|stopped| *stopped) => {
                    info!("Stopping log subscriptions");
                    return Ok(());
                }
            }
        }
    }

    async fn process_pushed(
        &self,
        channels: &RecordChannels,
        chunk: Vec<(usize, RawLog)>,
        caught_up_to: u64,
    ) -> Result<()> {
        // Group by target, keeping arrival order within each
        let mut by_target: BTreeMap<usize, Vec<RawLog>> = BTreeMap::new();
        for (index, log) in chunk {
            if log.block_number <= caught_up_to {
                continue;
            }
            by_target.entry(index).or_default().push(log);
        }

        for (index, logs) in by_target {
            let Some(target) = self.targets.get(index) else {
                continue;
            };
            let max_block = logs.iter().map(|log| log.block_number).max().unwrap_or_default();
            let batch = self.run_pipeline(target, &logs).await?;
            debug!(
                "Subscribed logs for {}: {} event logs, {} diagnostics",
                target.address,
                batch.event_logs.len(),
                batch.diagnostics.len()
            );
            channels.send_batch(batch, max_block).await?;
            self.record_progress(max_block, max_block);
        }
        Ok(())
    }

    fn record_progress(&self, processed_block: u64, latest_block: u64) {
        // Update metrics
        if let Some(metrics) = &self.metrics {
            let labels = [KeyValue::new("chain", metrics.chain_name.clone())];
            metrics
                .latest_processed_block
                .record(processed_block, &labels);
            metrics.chain_tip_block.record(latest_block, &labels);
            metrics
                .chain_tip_lag
                .record(latest_block.saturating_sub(processed_block), &labels);
        }
    }
}
