use std::future::Future;
use std::time::{Duration, Instant};

use alloy_network::TransactionResponse;
use alloy_primitives::{Address, B256};
use alloy_provider::Provider;
use alloy_rpc_types_eth::Filter;
use alloy_transport::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::KeyValue;
use tracing::warn;

use crate::indexer::rpc::{ChainClient, ChainTransaction, LogStream};
use crate::metrics::Metrics;
use crate::models::common::RpcConfig;
use crate::models::datasets::logs::RawLog;
use crate::models::errors::ClientError;
use crate::utils::retry::{RetryConfig, retry};
use crate::utils::strip_html;

/// `ChainClient` backed by an alloy provider. Each request is bounded by a
/// timeout and retried on transient failures.
pub struct AlloyChainClient<P> {
    provider: P,
    retry_config: RetryConfig,
    timeout: Duration,
    metrics: Option<Metrics>,
}

impl<P: Provider> AlloyChainClient<P> {
    pub fn new(provider: P, rpc: &RpcConfig, metrics: Option<Metrics>) -> Self {
        Self {
            provider,
            retry_config: RetryConfig::from(rpc),
            timeout: Duration::from_millis(rpc.timeout_ms),
            metrics,
        }
    }

    async fn call<T, F, Fut>(&self, method: &'static str, operation: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        retry(
            || async {
                let start = Instant::now();

                // Record metrics if enabled
                if let Some(metrics) = &self.metrics {
                    metrics.rpc_requests.add(1, &self.labels(method));
                }

                let result = match tokio::time::timeout(self.timeout, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout {
                        method,
                        after: self.timeout,
                    }),
                };

                if let Some(metrics) = &self.metrics {
                    metrics
                        .rpc_latency
                        .record(start.elapsed().as_secs_f64(), &self.labels(method));
                    if result.is_err() {
                        metrics.rpc_errors.add(1, &self.labels(method));
                    }
                }

                result
            },
            &self.retry_config,
            method,
        )
        .await
    }

    fn labels(&self, method: &'static str) -> [KeyValue; 2] {
        let chain = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.chain_name.clone())
            .unwrap_or_default();
        [KeyValue::new("chain", chain), KeyValue::new("method", method)]
    }
}

fn network_error(method: &'static str, error: TransportError) -> ClientError {
    ClientError::Network {
        method,
        message: strip_html(&error.to_string()),
    }
}

fn to_raw_logs(logs: Vec<alloy_rpc_types_eth::Log>) -> Vec<RawLog> {
    logs.into_iter()
        .filter_map(|log| match RawLog::try_from(log) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("Dropping log without chain context: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl<P: Provider + 'static> ChainClient for AlloyChainClient<P> {
    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        self.call("latest_block_number", || async {
            self.provider
                .get_block_number()
                .await
                .map_err(|e| network_error("latest_block_number", e))
        })
        .await
    }

    async fn filter_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ClientError> {
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .call("filter_logs", || async {
                self.provider.get_logs(&filter).await.map_err(|e| {
                    warn!(
                        "Failed to get logs for {} in blocks {}-{}. Error details:\n{:#?}",
                        address, from_block, to_block, e
                    );
                    network_error("filter_logs", e)
                })
            })
            .await?;

        Ok(to_raw_logs(logs))
    }

    async fn transaction_by_hash(
        &self,
        hash: B256,
    ) -> Result<(ChainTransaction, bool), ClientError> {
        let transaction = self
            .call("transaction_by_hash", || async {
                self.provider
                    .get_transaction_by_hash(hash)
                    .await
                    .map_err(|e| network_error("transaction_by_hash", e))?
                    .ok_or_else(|| ClientError::NotFound {
                        method: "transaction_by_hash",
                        what: format!("transaction {}", hash),
                    })
            })
            .await?;

        let pending = transaction.block_hash().is_none();
        Ok((
            ChainTransaction {
                hash,
                from: transaction.from(),
                block_hash: transaction.block_hash(),
                block_number: transaction.block_number(),
                transaction_index: transaction.transaction_index(),
            },
            pending,
        ))
    }

    async fn transaction_sender(
        &self,
        transaction: &ChainTransaction,
        block_hash: Option<B256>,
        transaction_index: Option<u64>,
    ) -> Result<Address, ClientError> {
        // The signer is recovered by the node; it only applies if the
        // transaction is still where the log says it is.
        let moved = matches!((block_hash, transaction.block_hash), (Some(expected), Some(actual)) if expected != actual)
            || matches!((transaction_index, transaction.transaction_index), (Some(expected), Some(actual)) if expected != actual);
        if moved {
            return Err(ClientError::NotFound {
                method: "transaction_sender",
                what: format!(
                    "transaction {} at {:?}/{:?}",
                    transaction.hash, block_hash, transaction_index
                ),
            });
        }
        Ok(transaction.from)
    }

    async fn subscribe_logs(&self, address: Address) -> Result<LogStream, ClientError> {
        let filter = Filter::new().address(address);
        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| network_error("subscribe_logs", e))?;

        let stream = subscription
            .into_stream()
            .filter_map(|log| async move {
                match RawLog::try_from(log) {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        warn!("Dropping subscribed log without chain context: {}", e);
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn is_contract(&self, address: Address) -> Result<bool, ClientError> {
        self.call("is_contract", || async {
            self.provider
                .get_code_at(address)
                .await
                .map(|code| !code.is_empty())
                .map_err(|e| network_error("is_contract", e))
        })
        .await
    }
}
