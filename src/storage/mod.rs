pub mod memory;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{Address, B256};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::indexer::ProcessedBatch;
use crate::metrics::Metrics;
use crate::models::datasets::logs::{EventLogRecord, UserActionRecord};
use crate::models::errors::StorageError;

const MAX_CHANNEL_CAPACITY: usize = 1024;
const MIN_FREE_CAPACITY: usize = MAX_CHANNEL_CAPACITY / 10;
const BATCH_SIZE: usize = 10; // Number of blocks to batch together
const MAX_BATCH_WAIT: Duration = Duration::from_secs(5); // Maximum time to wait for a batch
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60 * 5);

/////////////////////////////////// Repositories ///////////////////////////////////////
/// Conditions for an event log query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLogFilter {
    pub contract_address: Option<Address>,
    pub event_name: Option<String>,
    pub transaction_hash: Option<B256>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl EventLogFilter {
    pub fn matches(&self, record: &EventLogRecord) -> bool {
        self.contract_address
            .is_none_or(|address| record.contract_address == address)
            && self
                .event_name
                .as_deref()
                .is_none_or(|name| record.event_name == name)
            && self
                .transaction_hash
                .is_none_or(|hash| record.transaction_hash == hash)
            && self.from_block.is_none_or(|from| record.block_number >= from)
            && self.to_block.is_none_or(|to| record.block_number <= to)
    }
}

#[async_trait]
pub trait EventLogRepository: Send + Sync {
    /// Fails with `Duplicate` if the id is taken. Source logs are not deduplicated.
    async fn create_event_log(&self, record: EventLogRecord) -> Result<(), StorageError>;

    /// Replaces an existing record by id.
    async fn save_event_log(&self, record: EventLogRecord) -> Result<(), StorageError>;

    async fn find_event_log(&self, id: Uuid) -> Result<EventLogRecord, StorageError>;

    async fn event_log_exists(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Matching records in creation order.
    async fn query_event_logs(
        &self,
        filter: &EventLogFilter,
    ) -> Result<Vec<EventLogRecord>, StorageError>;

    async fn count_event_logs(&self, filter: &EventLogFilter) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait UserActionRepository: Send + Sync {
    /// Stores an action under the address string it was grouped by.
    async fn create_user_action(
        &self,
        owner: &str,
        record: UserActionRecord,
    ) -> Result<(), StorageError>;

    async fn find_user_action(&self, id: Uuid) -> Result<UserActionRecord, StorageError>;

    async fn user_action_exists(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn actions_for_owner(&self, owner: &str) -> Result<Vec<UserActionRecord>, StorageError>;

    async fn actions_for_event_log(
        &self,
        event_log_id: Uuid,
    ) -> Result<Vec<UserActionRecord>, StorageError>;
}

////////////////////////////////////// Channels ////////////////////////////////////////
pub type OwnedAction = (String, UserActionRecord);

#[derive(Clone)]
pub struct RecordChannels {
    pub event_logs_tx: Sender<(Vec<EventLogRecord>, u64)>,
    pub user_actions_tx: Sender<(Vec<OwnedAction>, u64)>,
    shutdown: broadcast::Sender<()>,
    // Track last stored block for each worker
    progress: Arc<WorkerProgress>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Default)]
struct WorkerProgress {
    event_logs: AtomicU64,
    user_actions: AtomicU64,
}

impl RecordChannels {
    /// Signals every worker, then waits for them to flush what they hold.
    pub async fn shutdown(&self) -> Result<()> {
        // Workers may already be gone if shutdown was signalled twice
        let _ = self.shutdown.send(());

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles))
            .await
            .map_err(|_| anyhow!("Shutdown timeout"))?;

        for result in joined {
            if let Err(e) = result {
                error!("Storage worker panicked: {}", e);
            }
        }

        info!(
            "Storage workers flushed. Progress: event_logs={}, user_actions={}",
            self.progress.event_logs.load(Ordering::Relaxed),
            self.progress.user_actions.load(Ordering::Relaxed),
        );
        Ok(())
    }

    /// Last block stored by the event log and user action workers.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.progress.event_logs.load(Ordering::Relaxed),
            self.progress.user_actions.load(Ordering::Relaxed),
        )
    }

    /// Whether both channels have room for more batches.
    pub async fn check_capacity(&self, metrics: Option<&Metrics>) -> bool {
        let event_logs = self.event_logs_tx.capacity();
        let user_actions = self.user_actions_tx.capacity();

        if let Some(metrics) = metrics {
            for (channel, capacity) in [("event_logs", event_logs), ("user_actions", user_actions)]
            {
                metrics.channel_capacity.record(
                    capacity as u64,
                    &[
                        KeyValue::new("chain", metrics.chain_name.clone()),
                        KeyValue::new("channel", channel),
                    ],
                );
            }
        }

        event_logs >= MIN_FREE_CAPACITY && user_actions >= MIN_FREE_CAPACITY
    }

    /// Hands a processed batch to the storage workers.
    pub async fn send_batch(&self, batch: ProcessedBatch, block_number: u64) -> Result<()> {
        let actions: Vec<OwnedAction> = batch
            .user_actions
            .into_iter()
            .flat_map(|(owner, actions)| actions.into_iter().map(move |a| (owner.clone(), a)))
            .collect();

        if !batch.event_logs.is_empty() {
            self.event_logs_tx
                .send((batch.event_logs, block_number))
                .await
                .map_err(|e| anyhow!("Failed to send event log batch to channel: {}", e))?;
        }
        if !actions.is_empty() {
            self.user_actions_tx
                .send((actions, block_number))
                .await
                .map_err(|e| anyhow!("Failed to send user action batch to channel: {}", e))?;
        }
        Ok(())
    }
}

/// Starts one batching worker per record type, writing into `store`.
pub async fn setup_channels<S>(store: Arc<S>) -> Result<RecordChannels>
where
    S: EventLogRepository + UserActionRepository + 'static,
{
    let (event_logs_tx, event_logs_rx) = mpsc::channel(MAX_CHANNEL_CAPACITY);
    let (user_actions_tx, user_actions_rx) = mpsc::channel(MAX_CHANNEL_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel(1);
    let progress = Arc::new(WorkerProgress::default());

    let event_log_store = store.clone();
    let event_log_progress = progress.clone();
    let event_logs_worker = tokio::spawn(run_worker(
        "event_logs",
        event_logs_rx,
        shutdown_tx.subscribe(),
        move |records: Vec<EventLogRecord>, max_block| {
            let store = event_log_store.clone();
            let progress = event_log_progress.clone();
            async move {
                let total = records.len();
                let mut lost = 0;
                for record in records {
                    let id = record.id;
                    if let Err(e) = store.create_event_log(record).await {
                        error!("Failed to store event log {}: {}", id, e);
                        lost += 1;
                    }
                }
                progress.event_logs.store(max_block, Ordering::Relaxed);
                incomplete(lost, total)
            }
        },
    ));

    let action_store = store;
    let action_progress = progress.clone();
    let user_actions_worker = tokio::spawn(run_worker(
        "user_actions",
        user_actions_rx,
        shutdown_tx.subscribe(),
        move |actions: Vec<OwnedAction>, max_block| {
            let store = action_store.clone();
            let progress = action_progress.clone();
            async move {
                let total = actions.len();
                let mut lost = 0;
                for (owner, action) in actions {
                    let id = action.id;
                    if let Err(e) = store.create_user_action(&owner, action).await {
                        error!("Failed to store user action {} for {}: {}", id, owner, e);
                        lost += 1;
                    }
                }
                progress.user_actions.store(max_block, Ordering::Relaxed);
                incomplete(lost, total)
            }
        },
    ));

    Ok(RecordChannels {
        event_logs_tx,
        user_actions_tx,
        shutdown: shutdown_tx,
        progress,
        workers: Arc::new(Mutex::new(vec![event_logs_worker, user_actions_worker])),
    })
}

fn incomplete(lost: usize, total: usize) -> Result<(), StorageError> {
    if lost == 0 {
        Ok(())
    } else {
        Err(StorageError::Incomplete { lost, total })
    }
}

/// Collects records until `BATCH_SIZE` distinct blocks or `MAX_BATCH_WAIT` have
/// passed, then writes them. On shutdown the pending batch and anything still
/// queued are written before the worker exits.
async fn run_worker<T, W, Fut>(
    name: &'static str,
    mut rx: Receiver<(Vec<T>, u64)>,
    mut shutdown_rx: broadcast::Receiver<()>,
    write: W,
) where
    T: Send + 'static,
    W: Fn(Vec<T>, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StorageError>> + Send,
{
    let mut batch = Vec::new();
    let mut min_block = u64::MAX;
    let mut max_block = 0;
    let mut block_numbers = HashSet::new();
    let mut last_batch_time = Instant::now();
    let mut ticker = tokio::time::interval(MAX_BATCH_WAIT);

    loop {
        tokio::select! {
            Some((records, block_number)) = rx.recv() => {
                batch.extend(records);
                min_block = min_block.min(block_number);
                max_block = max_block.max(block_number);
                block_numbers.insert(block_number);

                if block_numbers.len() < BATCH_SIZE && last_batch_time.elapsed() < MAX_BATCH_WAIT {
                    continue;
                }
            }
            _ = ticker.tick() => {
                if last_batch_time.elapsed() < MAX_BATCH_WAIT {
                    continue;
                }
            }
            res = shutdown_rx.recv() => {
                match res {
                    Ok(_) => debug!("{} worker received shutdown signal.", name),
                    Err(broadcast::error::RecvError::Closed) => debug!("{} worker shutdown channel closed.", name),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("{} worker lagged and missed {} shutdown signals. Proceeding with shutdown.", name, n),
                }
                debug!("{} worker processing remaining items...", name);
                // Anything still queued joins the final batch
                while let Ok((records, block_number)) = rx.try_recv() {
                    batch.extend(records);
                    min_block = min_block.min(block_number);
                    max_block = max_block.max(block_number);
                }
                if !batch.is_empty() {
                    flush(name, &write, std::mem::take(&mut batch), min_block, max_block).await;
                }
                break;
            }
        }

        if !batch.is_empty() {
            flush(name, &write, std::mem::take(&mut batch), min_block, max_block).await;
        }
        min_block = u64::MAX;
        max_block = 0;
        block_numbers.clear();
        last_batch_time = Instant::now();
    }

    info!("{} worker shut down", name);
}

async fn flush<T, W, Fut>(name: &str, write: &W, batch: Vec<T>, min_block: u64, max_block: u64)
where
    W: Fn(Vec<T>, u64) -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let count = batch.len();
    match write(batch, max_block).await {
        Ok(()) => debug!(
            "{} worker stored {} records (blocks {}-{})",
            name, count, min_block, max_block
        ),
        Err(e) => error!(
            "Failed to insert {} batch (blocks {}-{}): {}",
            name, min_block, max_block, e
        ),
    }
}
