pub mod decoder;
pub mod log_processor;
pub mod matcher;
pub mod normalizer;
pub mod registry;
pub mod rpc;

use std::collections::HashMap;
use std::time::Instant;

use alloy_primitives::B256;
use futures::{StreamExt, stream};
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::indexer::decoder::decode_log;
use crate::indexer::matcher::match_log;
use crate::indexer::normalizer::{NormalizedLog, normalize};
use crate::indexer::registry::FamilyRegistry;
use crate::indexer::rpc::ChainClient;
use crate::metrics::Metrics;
use crate::models::common::PipelineConfig;
use crate::models::datasets::logs::{EventDefinition, EventLogRecord, RawLog, UserActionRecord};
use crate::models::errors::LogError;

/// Why a log produced no records, or produced them under the unresolved key.
#[derive(Debug)]
pub struct LogDiagnostic {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub error: LogError,
}

/// The possibly partial output of one batch. A log missing from the records
/// has a matching entry in `diagnostics`.
#[derive(Debug, Default)]
pub struct ProcessedBatch {
    /// In input order.
    pub event_logs: Vec<EventLogRecord>,
    /// Keyed by checksummed sender address.
    pub user_actions: HashMap<String, Vec<UserActionRecord>>,
    pub diagnostics: Vec<LogDiagnostic>,
}

impl ProcessedBatch {
    pub fn action_count(&self) -> usize {
        self.user_actions.values().map(Vec::len).sum()
    }

    fn absorb(&mut self, normalized: NormalizedLog) {
        self.event_logs.push(normalized.event_log);
        self.user_actions
            .entry(normalized.sender)
            .or_default()
            .push(normalized.action);
    }
}

async fn process_log<C: ChainClient + ?Sized>(
    client: &C,
    family: &FamilyRegistry,
    log: &RawLog,
    definitions: &[EventDefinition],
    config: &PipelineConfig,
) -> Result<NormalizedLog, LogError> {
    let (definition, shape) = match_log(log, definitions, family)?;
    let decoded = decode_log(log, shape)?;
    normalize(client, log, definition, &decoded, config.sender_policy).await
}

/// Runs match, decode and normalize over a batch of logs from one family.
/// Failures stay with the log that caused them; the rest of the batch proceeds.
pub async fn process_logs<C: ChainClient + ?Sized>(
    client: &C,
    family: &FamilyRegistry,
    logs: &[RawLog],
    definitions: &[EventDefinition],
    config: &PipelineConfig,
    metrics: Option<&Metrics>,
) -> ProcessedBatch {
    let start = Instant::now();

    let results: Vec<_> = stream::iter(logs)
        .map(|log| async move { (log, process_log(client, family, log, definitions, config).await) })
        .buffered(config.concurrency.max(1))
        .collect()
        .await;

    let mut batch = ProcessedBatch::default();
    for (log, result) in results {
        match result {
            Ok(mut normalized) => {
                if let Some(error) = normalized.sender_error.take() {
                    batch.diagnostics.push(diagnostic(log, error));
                }
                batch.absorb(normalized);
            }
            Err(error) => {
                if error.is_skip() {
                    debug!(
                        "Skipping log {}:{} from {}: {}",
                        log.transaction_hash, log.log_index, log.address, error
                    );
                } else {
                    warn!(
                        "Dropping log {}:{} from {}: {}",
                        log.transaction_hash, log.log_index, log.address, error
                    );
                }
                if let Some(metrics) = metrics {
                    let counter = if error.is_skip() {
                        &metrics.logs_skipped
                    } else {
                        &metrics.logs_failed
                    };
                    counter.add(
                        1,
                        &[
                            KeyValue::new("chain", metrics.chain_name.clone()),
                            KeyValue::new("family", family.family.as_str()),
                            KeyValue::new("reason", error.reason()),
                        ],
                    );
                }
                batch.diagnostics.push(diagnostic(log, error));
            }
        }
    }

    // Update metrics
    if let Some(metrics) = metrics {
        let labels = [
            KeyValue::new("chain", metrics.chain_name.clone()),
            KeyValue::new("family", family.family.as_str()),
        ];
        metrics.logs_received.add(logs.len() as u64, &labels);
        metrics
            .event_records
            .add(batch.event_logs.len() as u64, &labels);
        metrics
            .user_actions
            .add(batch.action_count() as u64, &labels);
        metrics
            .batch_processing_time
            .record(start.elapsed().as_secs_f64(), &labels);
    }

    batch
}

fn diagnostic(log: &RawLog, error: LogError) -> LogDiagnostic {
    LogDiagnostic {
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes, U256};
    use uuid::Uuid;

    use crate::indexer::registry::EventRegistry;
    use crate::indexer::rpc::{ChainTransaction, MockChainClient};
    use crate::models::common::EventFamily;
    use crate::models::datasets::logs::ContractRef;

    fn erc20_log(selector: B256, log_index: u64, data: Vec<u8>) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xcc),
            topics: vec![
                selector,
                Address::repeat_byte(0xa1).into_word(),
                Address::repeat_byte(0xb2).into_word(),
            ],
            data: Bytes::from(data),
            block_number: 9,
            block_hash: Some(B256::repeat_byte(0x01)),
            transaction_hash: B256::with_last_byte(log_index as u8),
            transaction_index: Some(0),
            log_index,
        }
    }

    fn client() -> MockChainClient {
        let mut client = MockChainClient::new();
        client.expect_transaction_by_hash().returning(|hash| {
            Ok((
                ChainTransaction {
                    hash,
                    from: Address::repeat_byte(0x5e),
                    block_hash: Some(B256::repeat_byte(0x01)),
                    block_number: Some(9),
                    transaction_index: Some(0),
                },
                false,
            ))
        });
        client
            .expect_transaction_sender()
            .returning(|tx, _, _| Ok(tx.from));
        client
    }

    #[tokio::test]
    async fn test_process_logs_isolates_bad_payload() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let transfer = erc20.shape("Transfer").unwrap().selector;
        let definitions = vec![EventDefinition {
            id: Uuid::now_v7(),
            contract: ContractRef {
                id: Uuid::now_v7(),
                address: Address::repeat_byte(0xcc),
                family: EventFamily::Erc20,
            },
            name: "Transfer".to_string(),
            signature: transfer,
        }];

        let good = U256::from(5).to_be_bytes::<32>().to_vec();
        let logs = vec![
            erc20_log(transfer, 0, good.clone()),
            erc20_log(transfer, 1, vec![0x01]),
            erc20_log(B256::repeat_byte(0x77), 2, good.clone()),
            erc20_log(transfer, 3, good),
        ];

        let config = PipelineConfig {
            concurrency: 2,
            ..PipelineConfig::default()
        };
        let batch = process_logs(&client(), erc20, &logs, &definitions, &config, None).await;

        let indexes: Vec<u64> = batch.event_logs.iter().map(|r| r.log_index).collect();
        assert_eq!(indexes, vec![0, 3]);
        assert_eq!(batch.action_count(), 2);
        assert_eq!(batch.diagnostics.len(), 2);
        assert!(matches!(batch.diagnostics[0].error, LogError::Decode(_)));
        assert_eq!(batch.diagnostics[0].log_index, 1);
        assert!(batch.diagnostics[1].error.is_skip());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let batch = process_logs(
            &MockChainClient::new(),
            erc20,
            &[],
            &[],
            &PipelineConfig::default(),
            None,
        )
        .await;

        assert!(batch.event_logs.is_empty());
        assert!(batch.user_actions.is_empty());
        assert!(batch.diagnostics.is_empty());
    }
}
