use std::time::Duration;

use alloy_primitives::B256;
use thiserror::Error;

use crate::models::common::EventFamily;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid ABI for {family} family: {source}")]
    InvalidAbi {
        family: EventFamily,
        #[source]
        source: serde_json::Error,
    },
    #[error("Event {event} is not declared in the {family} ABI")]
    MissingEvent { family: EventFamily, event: String },
    #[error("Event {event} declares {count} overloads in the {family} ABI, expected exactly one")]
    OverloadedEvent {
        family: EventFamily,
        event: String,
        count: usize,
    },
    #[error("Unresolvable type for parameter {param} of {event}: {reason}")]
    UnresolvableType {
        event: String,
        param: String,
        reason: String,
    },
    #[error("Topic layout for {event} does not match its ABI: {reason}")]
    LayoutMismatch { event: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Payload does not match the {event} ABI: {source}")]
    Payload {
        event: String,
        #[source]
        source: alloy_dyn_abi::Error,
    },
    #[error("Topic {index} required by {event} is missing (log has {available} topics)")]
    MissingTopic {
        event: String,
        index: usize,
        available: usize,
    },
    #[error("Field {field} expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },
    #[error("Field {field} has no counterpart in the decoded shape")]
    UnknownField { field: String },
    #[error("Field {field} was assigned by both payload and topics")]
    FieldAssignedTwice { field: String },
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Network error during {method}: {message}")]
    Network { method: &'static str, message: String },
    #[error("{method}: {what} not found")]
    NotFound { method: &'static str, what: String },
    #[error("{method} timed out after {after:?}")]
    Timeout { method: &'static str, after: Duration },
}

impl ClientError {
    /// Network failures and timeouts may succeed on a later attempt; not-found never does.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Log carries no topics")]
    NoTopics,
    #[error("No registered event matches signature {signature}")]
    Unmatched { signature: B256 },
    #[error("Event {event} has no decoded shape in the {family} family")]
    UnknownEvent { family: EventFamily, event: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Transaction lookup failed: {0}")]
    TransactionLookup(#[source] ClientError),
    #[error("Sender resolution failed: {0}")]
    SenderResolution(#[source] ClientError),
    #[error("Failed to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl LogError {
    /// Expected input that is not ours to process, as opposed to a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::NoTopics | Self::Unmatched { .. } | Self::UnknownEvent { .. }
        )
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoTopics => "no_topics",
            Self::Unmatched { .. } => "unmatched",
            Self::UnknownEvent { .. } => "unknown_event",
            Self::Decode(_) => "decode",
            Self::TransactionLookup(_) => "transaction_lookup",
            Self::SenderResolution(_) => "sender_resolution",
            Self::Serialization { .. } => "serialization",
        }
    }
}

#[derive(Error, Debug)]
pub enum LogConversionError {
    #[error("Missing required field in log: {field}")]
    MissingField { field: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record {id} not found")]
    NotFound { id: uuid::Uuid },
    #[error("Record {id} already exists")]
    Duplicate { id: uuid::Uuid },
    #[error("{lost} of {total} records were not stored")]
    Incomplete { lost: usize, total: usize },
}
