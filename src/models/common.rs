use std::fmt;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::indexer::registry::EventRegistry;
use crate::models::datasets::logs::{ContractRef, EventDefinition};
use crate::models::errors::RegistryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

/// Per-call limits for chain-client requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

/// What to do with a log whose transaction sender cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPolicy {
    /// Drop the log from both outputs.
    #[default]
    Drop,
    /// Keep the event record and file the action under the unresolved sender key.
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub sender_policy: SenderPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            sender_policy: SenderPolicy::Drop,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractEventConfig {
    pub id: Uuid,
    pub name: String,
    // Falls back to the ABI selector when omitted
    pub signature: Option<B256>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub id: Uuid,
    pub address: Address,
    pub family: EventFamily,
    pub events: Vec<ContractEventConfig>,
}

impl ContractConfig {
    pub fn contract_ref(&self) -> ContractRef {
        ContractRef {
            id: self.id,
            address: self.address,
            family: self.family,
        }
    }

    /// Builds the subscribable event definitions for this contract.
    pub fn event_definitions(
        &self,
        registry: &EventRegistry,
    ) -> Result<Vec<EventDefinition>, RegistryError> {
        let family = registry.family(self.family);
        self.events
            .iter()
            .map(|event| {
                let signature = match event.signature {
                    Some(signature) => signature,
                    None => {
                        family
                            .and_then(|family| family.shape(&event.name))
                            .ok_or_else(|| RegistryError::MissingEvent {
                                family: self.family,
                                event: event.name.clone(),
                            })?
                            .selector
                    }
                };
                Ok(EventDefinition {
                    id: event.id,
                    contract: self.contract_ref(),
                    name: event.name.clone(),
                    signature,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain_name: String,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub block_range: u64,
    pub chain_tip_buffer: u64,
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    pub metrics: MetricsConfig,
}

/// A group of contract events sharing one ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Erc20,
    PoolSwap,
    Bridge,
}

impl EventFamily {
    pub const ALL: [EventFamily; 3] = [Self::Erc20, Self::PoolSwap, Self::Bridge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::PoolSwap => "pool_swap",
            Self::Bridge => "bridge",
        }
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
