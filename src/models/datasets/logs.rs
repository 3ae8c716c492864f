use alloy_primitives::{Address, B256, Bytes};
use alloy_rpc_types_eth::Log;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::common::EventFamily;
use crate::models::errors::LogConversionError;

////////////////////////////////////// RPC Data ////////////////////////////////////////
/// A contract log as delivered by the chain client. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    // topics[0] is the event signature hash
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub transaction_hash: B256,
    pub transaction_index: Option<u64>,
    pub log_index: u64,
}

impl RawLog {
    pub fn signature(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

impl TryFrom<Log> for RawLog {
    type Error = LogConversionError;

    fn try_from(log: Log) -> Result<Self, Self::Error> {
        let missing = |field: &str| LogConversionError::MissingField {
            field: field.to_string(),
        };

        let block_number = log.block_number.ok_or_else(|| missing("block_number"))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| missing("transaction_hash"))?;
        let log_index = log.log_index.ok_or_else(|| missing("log_index"))?;
        let topics = log.inner.data.topics().to_vec();

        Ok(Self {
            address: log.inner.address,
            topics,
            data: log.inner.data.data,
            block_number,
            block_hash: log.block_hash,
            transaction_hash,
            transaction_index: log.transaction_index,
            log_index,
        })
    }
}

/////////////////////////////////// Definitions ///////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRef {
    pub id: Uuid,
    pub address: Address,
    // The contract's ABI, resolved through the event registry
    pub family: EventFamily,
}

/// A known, subscribable contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: Uuid,
    pub contract: ContractRef,
    pub name: String,
    pub signature: B256,
}

/////////////////////////////////// Output Records ////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogRecord {
    pub id: Uuid,
    pub contract_address: Address,
    pub contract_event_id: Uuid,
    pub event_name: String,
    pub contract_id: Uuid,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// JSON object with exactly two keys: `raw` and `formatted`.
    pub data: String,
    /// JSON array of hex topics, topic[0] included.
    pub topics: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserActionRecord {
    pub id: Uuid,
    pub action: String,
    pub event_log_id: Uuid,
    pub transaction_hash: B256,
    pub point: u32,
    pub created_at: DateTime<Utc>,
}
