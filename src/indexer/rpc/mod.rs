pub mod provider;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::datasets::logs::RawLog;
use crate::models::errors::ClientError;

pub use provider::AlloyChainClient;

/// Push-based stream of logs from a live subscription.
pub type LogStream = BoxStream<'static, RawLog>;

/// The parts of a transaction the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub from: Address,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub transaction_index: Option<u64>,
}

/// Chain node access consumed by the pipeline. Every call may fail with a
/// network error, which is distinct from not-found.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ClientError>;

    async fn filter_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ClientError>;

    /// Returns the transaction and whether it is still pending.
    async fn transaction_by_hash(&self, hash: B256)
    -> Result<(ChainTransaction, bool), ClientError>;

    async fn transaction_sender(
        &self,
        transaction: &ChainTransaction,
        block_hash: Option<B256>,
        transaction_index: Option<u64>,
    ) -> Result<Address, ClientError>;

    async fn subscribe_logs(&self, address: Address) -> Result<LogStream, ClientError>;

    async fn is_contract(&self, address: Address) -> Result<bool, ClientError>;
}
