use alloy_primitives::{Address, hex};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::indexer::rpc::ChainClient;
use crate::models::common::SenderPolicy;
use crate::models::datasets::events::DecodedEvent;
use crate::models::datasets::logs::{EventDefinition, EventLogRecord, RawLog, UserActionRecord};
use crate::models::errors::LogError;

/// Points credited for every derived user action.
pub const ACTION_POINTS: u32 = 1;

/// Key under which actions without a resolved sender are grouped. Unrelated
/// actions share this key, so consumers must check for it explicitly.
pub const UNRESOLVED_SENDER: &str = "0x0000000000000000000000000000000000000000";

/// One log turned into its two output records.
#[derive(Debug)]
pub struct NormalizedLog {
    pub event_log: EventLogRecord,
    /// Checksummed sender address, or `UNRESOLVED_SENDER`.
    pub sender: String,
    pub action: UserActionRecord,
    /// Set when the sender lookup failed but the policy kept the log.
    pub sender_error: Option<LogError>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    raw: String,
    formatted: &'a DecodedEvent,
}

/// Looks up the log's transaction and recovers who sent it. A pending
/// transaction resolves to `None` rather than an error.
pub async fn resolve_sender<C: ChainClient + ?Sized>(
    client: &C,
    log: &RawLog,
) -> Result<Option<Address>, LogError> {
    let (transaction, pending) = client
        .transaction_by_hash(log.transaction_hash)
        .await
        .map_err(LogError::TransactionLookup)?;

    if pending {
        debug!(
            "Transaction {} is pending, leaving sender unresolved",
            log.transaction_hash
        );
        return Ok(None);
    }

    client
        .transaction_sender(&transaction, log.block_hash, log.transaction_index)
        .await
        .map(Some)
        .map_err(LogError::SenderResolution)
}

pub fn build_event_log(
    log: &RawLog,
    definition: &EventDefinition,
    decoded: &DecodedEvent,
) -> Result<EventLogRecord, LogError> {
    let envelope = Envelope {
        raw: hex::encode(&log.data),
        formatted: decoded,
    };
    let data = serde_json::to_string(&envelope).map_err(|source| LogError::Serialization {
        what: "event data",
        source,
    })?;
    let topics = serde_json::to_string(&log.topics).map_err(|source| LogError::Serialization {
        what: "topics",
        source,
    })?;

    Ok(EventLogRecord {
        id: Uuid::now_v7(),
        contract_address: log.address,
        contract_event_id: definition.id,
        event_name: definition.name.clone(),
        contract_id: definition.contract.id,
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        data,
        topics,
        created_at: Utc::now(),
    })
}

pub fn derive_action(event_log: &EventLogRecord) -> UserActionRecord {
    UserActionRecord {
        id: Uuid::now_v7(),
        action: event_log.event_name.clone(),
        event_log_id: event_log.id,
        transaction_hash: event_log.transaction_hash,
        point: ACTION_POINTS,
        created_at: Utc::now(),
    }
}

/// Resolves the sender, then builds the event record and the action it earns.
pub async fn normalize<C: ChainClient + ?Sized>(
    client: &C,
    log: &RawLog,
    definition: &EventDefinition,
    decoded: &DecodedEvent,
    policy: SenderPolicy,
) -> Result<NormalizedLog, LogError> {
    let (sender, sender_error) = match resolve_sender(client, log).await {
        Ok(sender) => (sender, None),
        Err(e) if policy == SenderPolicy::Unresolved => {
            warn!(
                "Keeping log {}:{} under unresolved sender: {}",
                log.transaction_hash, log.log_index, e
            );
            (None, Some(e))
        }
        Err(e) => return Err(e),
    };

    let event_log = build_event_log(log, definition, decoded)?;
    let action = derive_action(&event_log);
    let sender = match sender {
        Some(address) => address.to_checksum(None),
        None => UNRESOLVED_SENDER.to_string(),
    };

    Ok(NormalizedLog {
        event_log,
        sender,
        action,
        sender_error,
    })
}
