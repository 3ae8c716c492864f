use std::fmt::Display;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, I256, U256};
use serde::{Serialize, Serializer};

use crate::models::errors::DecodeError;

/// Receives decoded ABI parameters by name, from either the payload or a topic.
pub trait EventFields {
    fn assign(&mut self, field: &str, value: DynSolValue) -> Result<(), DecodeError>;
}

////////////////////////////////////// Shapes //////////////////////////////////////////
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogTransfer {
    pub from: Address,
    pub to: Address,
    #[serde(serialize_with = "decimal")]
    pub value: U256,
}

impl EventFields for LogTransfer {
    fn assign(&mut self, field: &str, value: DynSolValue) -> Result<(), DecodeError> {
        match field {
            "from" => self.from = expect_address(field, value)?,
            "to" => self.to = expect_address(field, value)?,
            "value" => self.value = expect_uint(field, value)?,
            _ => return Err(unknown(field)),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogApproval {
    pub owner: Address,
    pub spender: Address,
    #[serde(serialize_with = "decimal")]
    pub value: U256,
}

impl EventFields for LogApproval {
    fn assign(&mut self, field: &str, value: DynSolValue) -> Result<(), DecodeError> {
        match field {
            "owner" => self.owner = expect_address(field, value)?,
            "spender" => self.spender = expect_address(field, value)?,
            "value" => self.value = expect_uint(field, value)?,
            _ => return Err(unknown(field)),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSwap {
    pub sender: Address,
    pub recipient: Address,
    #[serde(serialize_with = "decimal")]
    pub amount0: I256,
    #[serde(serialize_with = "decimal")]
    pub amount1: I256,
    #[serde(rename = "sqrtPriceX96", serialize_with = "decimal")]
    pub sqrt_price_x96: U256,
    #[serde(serialize_with = "decimal")]
    pub liquidity: U256,
    #[serde(serialize_with = "decimal")]
    pub tick: I256,
}

impl Default for LogSwap {
    fn default() -> Self {
        Self {
            sender: Address::ZERO,
            recipient: Address::ZERO,
            amount0: I256::ZERO,
            amount1: I256::ZERO,
            sqrt_price_x96: U256::ZERO,
            liquidity: U256::ZERO,
            tick: I256::ZERO,
        }
    }
}

impl EventFields for LogSwap {
    fn assign(&mut self, field: &str, value: DynSolValue) -> Result<(), DecodeError> {
        match field {
            "sender" => self.sender = expect_address(field, value)?,
            "recipient" => self.recipient = expect_address(field, value)?,
            "amount0" => self.amount0 = expect_int(field, value)?,
            "amount1" => self.amount1 = expect_int(field, value)?,
            "sqrtPriceX96" => self.sqrt_price_x96 = expect_uint(field, value)?,
            "liquidity" => self.liquidity = expect_uint(field, value)?,
            "tick" => self.tick = expect_int(field, value)?,
            _ => return Err(unknown(field)),
        }
        Ok(())
    }
}

/// Shared by the bridge's sent and fulfilled events; they differ only in which
/// user is indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogBridgeTokens {
    pub from_user: Address,
    pub to_user: Address,
    pub from_chain: String,
    pub to_chain: String,
    #[serde(serialize_with = "decimal")]
    pub amount: U256,
    #[serde(serialize_with = "decimal")]
    pub exchange_rate: U256,
}

impl EventFields for LogBridgeTokens {
    fn assign(&mut self, field: &str, value: DynSolValue) -> Result<(), DecodeError> {
        match field {
            "fromUser" => self.from_user = expect_address(field, value)?,
            "toUser" => self.to_user = expect_address(field, value)?,
            "fromChain" => self.from_chain = expect_string(field, value)?,
            "toChain" => self.to_chain = expect_string(field, value)?,
            "amount" => self.amount = expect_uint(field, value)?,
            "exchangeRate" => self.exchange_rate = expect_uint(field, value)?,
            _ => return Err(unknown(field)),
        }
        Ok(())
    }
}

/////////////////////////////////// Decoded Event //////////////////////////////////////
/// A decoded event of one of the known families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)] // Serialize only the fields
pub enum DecodedEvent {
    Transfer(LogTransfer),
    Approval(LogApproval),
    Swap(LogSwap),
    SentTokens(LogBridgeTokens),
    FulfilledTokens(LogBridgeTokens),
}

impl DecodedEvent {
    pub fn fields_mut(&mut self) -> &mut dyn EventFields {
        match self {
            Self::Transfer(event) => event,
            Self::Approval(event) => event,
            Self::Swap(event) => event,
            Self::SentTokens(event) | Self::FulfilledTokens(event) => event,
        }
    }
}

/// The variant a decoded event takes, one per registered event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transfer,
    Approval,
    Swap,
    SentTokens,
    FulfilledTokens,
}

impl EventKind {
    /// An unpopulated value of the matching variant.
    pub fn empty(&self) -> DecodedEvent {
        match self {
            Self::Transfer => DecodedEvent::Transfer(LogTransfer::default()),
            Self::Approval => DecodedEvent::Approval(LogApproval::default()),
            Self::Swap => DecodedEvent::Swap(LogSwap::default()),
            Self::SentTokens => DecodedEvent::SentTokens(LogBridgeTokens::default()),
            Self::FulfilledTokens => DecodedEvent::FulfilledTokens(LogBridgeTokens::default()),
        }
    }
}

fn decimal<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn unknown(field: &str) -> DecodeError {
    DecodeError::UnknownField {
        field: field.to_string(),
    }
}

fn mismatch(field: &str, expected: &'static str, value: &DynSolValue) -> DecodeError {
    DecodeError::TypeMismatch {
        field: field.to_string(),
        expected,
        got: format!("{:?}", value),
    }
}

fn expect_address(field: &str, value: DynSolValue) -> Result<Address, DecodeError> {
    value
        .as_address()
        .ok_or_else(|| mismatch(field, "address", &value))
}

fn expect_uint(field: &str, value: DynSolValue) -> Result<U256, DecodeError> {
    value
        .as_uint()
        .map(|(uint, _)| uint)
        .ok_or_else(|| mismatch(field, "uint", &value))
}

fn expect_int(field: &str, value: DynSolValue) -> Result<I256, DecodeError> {
    value
        .as_int()
        .map(|(int, _)| int)
        .ok_or_else(|| mismatch(field, "int", &value))
}

fn expect_string(field: &str, value: DynSolValue) -> Result<String, DecodeError> {
    match value {
        DynSolValue::String(string) => Ok(string),
        other => Err(mismatch(field, "string", &other)),
    }
}
