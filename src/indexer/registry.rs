use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, Specifier};
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::B256;
use once_cell::sync::OnceCell;
use tracing::info;

use crate::models::common::EventFamily;
use crate::models::datasets::events::{DecodedEvent, EventKind};
use crate::models::errors::RegistryError;

const ERC20_ABI: &str = include_str!("../../abi/erc20.json");
const POOL_SWAP_ABI: &str = include_str!("../../abi/pool_swap.json");
const BRIDGE_ABI: &str = include_str!("../../abi/bridge.json");

pub const ABI_SOURCES: &[(EventFamily, &str)] = &[
    (EventFamily::Erc20, ERC20_ABI),
    (EventFamily::PoolSwap, POOL_SWAP_ABI),
    (EventFamily::Bridge, BRIDGE_ABI),
];

/// A topic position and the indexed parameter it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSlot {
    pub topic: usize,
    pub field: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct EventLayout {
    pub family: EventFamily,
    pub event: &'static str,
    pub kind: EventKind,
    pub topics: &'static [TopicSlot],
}

/// Every decodable event, and which topics carry its indexed parameters.
/// Adding a family means adding its ABI source and rows here.
pub const EVENT_LAYOUTS: &[EventLayout] = &[
    EventLayout {
        family: EventFamily::Erc20,
        event: "Transfer",
        kind: EventKind::Transfer,
        topics: &[
            TopicSlot { topic: 1, field: "from" },
            TopicSlot { topic: 2, field: "to" },
        ],
    },
    EventLayout {
        family: EventFamily::Erc20,
        event: "Approval",
        kind: EventKind::Approval,
        topics: &[
            TopicSlot { topic: 1, field: "owner" },
            TopicSlot { topic: 2, field: "spender" },
        ],
    },
    EventLayout {
        family: EventFamily::PoolSwap,
        event: "Swap",
        kind: EventKind::Swap,
        topics: &[
            TopicSlot { topic: 1, field: "sender" },
            TopicSlot { topic: 2, field: "recipient" },
        ],
    },
    EventLayout {
        family: EventFamily::Bridge,
        event: "SentTokens",
        kind: EventKind::SentTokens,
        topics: &[TopicSlot { topic: 1, field: "toUser" }],
    },
    EventLayout {
        family: EventFamily::Bridge,
        event: "FulfilledTokens",
        kind: EventKind::FulfilledTokens,
        topics: &[TopicSlot { topic: 1, field: "fromUser" }],
    },
];

#[derive(Debug, Clone)]
pub struct IndexedField {
    pub topic: usize,
    pub field: String,
    pub ty: DynSolType,
}

/// Everything the decoder needs to know about one event.
#[derive(Debug, Clone)]
pub struct EventShape {
    pub name: String,
    pub kind: EventKind,
    pub selector: B256,
    /// ABI entry the log is decoded against.
    pub event: Event,
    /// Non-indexed parameters, in payload order.
    pub body: Vec<(String, DynSolType)>,
    pub indexed: Vec<IndexedField>,
}

impl EventShape {
    pub fn empty(&self) -> DecodedEvent {
        self.kind.empty()
    }

    /// Topics a log of this event must carry, selector included.
    pub fn topic_count(&self) -> usize {
        self.event.num_topics()
    }
}

#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    pub family: EventFamily,
    pub abi: JsonAbi,
    shapes: HashMap<String, EventShape>,
}

impl FamilyRegistry {
    pub fn shape(&self, event: &str) -> Option<&EventShape> {
        self.shapes.get(event)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &EventShape> {
        self.shapes.values()
    }
}

/// Read-only mapping from event family to its ABI and decoded shapes.
#[derive(Debug, Clone)]
pub struct EventRegistry {
    families: HashMap<EventFamily, FamilyRegistry>,
}

static REGISTRY: OnceCell<EventRegistry> = OnceCell::new();

impl EventRegistry {
    /// The process-wide registry, built from the embedded ABIs on first use.
    pub fn global() -> Result<&'static EventRegistry, RegistryError> {
        REGISTRY.get_or_try_init(Self::build)
    }

    pub fn build() -> Result<Self, RegistryError> {
        Self::from_sources(ABI_SOURCES, EVENT_LAYOUTS)
    }

    /// Parses every ABI and validates every layout row against it. Any failure
    /// rejects the whole registry.
    pub fn from_sources(
        sources: &[(EventFamily, &str)],
        layouts: &[EventLayout],
    ) -> Result<Self, RegistryError> {
        let mut families = HashMap::with_capacity(sources.len());

        for (family, abi_json) in sources {
            let abi: JsonAbi = serde_json::from_str(abi_json).map_err(|source| {
                RegistryError::InvalidAbi {
                    family: *family,
                    source,
                }
            })?;

            let shapes = layouts
                .iter()
                .filter(|layout| layout.family == *family)
                .map(|layout| Ok((layout.event.to_string(), build_shape(&abi, layout)?)))
                .collect::<Result<HashMap<_, _>, RegistryError>>()?;

            info!("Registered {} events for {} family", shapes.len(), family);
            families.insert(
                *family,
                FamilyRegistry {
                    family: *family,
                    abi,
                    shapes,
                },
            );
        }

        Ok(Self { families })
    }

    pub fn family(&self, family: EventFamily) -> Option<&FamilyRegistry> {
        self.families.get(&family)
    }
}

fn build_shape(abi: &JsonAbi, layout: &EventLayout) -> Result<EventShape, RegistryError> {
    let mismatch = |reason: String| RegistryError::LayoutMismatch {
        event: layout.event.to_string(),
        reason,
    };

    let overloads = abi
        .events
        .get(layout.event)
        .ok_or_else(|| RegistryError::MissingEvent {
            family: layout.family,
            event: layout.event.to_string(),
        })?;
    let event = match overloads.as_slice() {
        [event] => event,
        _ => {
            return Err(RegistryError::OverloadedEvent {
                family: layout.family,
                event: layout.event.to_string(),
                count: overloads.len(),
            });
        }
    };
    if event.anonymous {
        return Err(mismatch("anonymous events carry no signature topic".to_string()));
    }

    let mut body = Vec::new();
    let mut indexed = Vec::new();
    for param in &event.inputs {
        let ty = param
            .resolve()
            .map_err(|e| RegistryError::UnresolvableType {
                event: layout.event.to_string(),
                param: param.name.clone(),
                reason: e.to_string(),
            })?;
        if param.indexed {
            indexed.push((param.name.clone(), ty));
        } else {
            body.push((param.name.clone(), ty));
        }
    }

    if indexed.len() != layout.topics.len() {
        return Err(mismatch(format!(
            "ABI declares {} indexed parameters, layout maps {}",
            indexed.len(),
            layout.topics.len()
        )));
    }

    // The n-th indexed parameter lives in topic n
    let indexed = layout
        .topics
        .iter()
        .map(|slot| {
            let position = indexed
                .iter()
                .position(|(name, _)| name == slot.field)
                .ok_or_else(|| mismatch(format!("{} is not an indexed parameter", slot.field)))?;
            if position + 1 != slot.topic {
                return Err(mismatch(format!(
                    "{} is indexed parameter {} but mapped to topic {}",
                    slot.field,
                    position + 1,
                    slot.topic
                )));
            }
            let ty = indexed[position].1.clone();
            if !is_word_type(&ty) {
                return Err(mismatch(format!(
                    "{} is hashed into its topic and cannot be recovered",
                    slot.field
                )));
            }
            Ok(IndexedField {
                topic: slot.topic,
                field: slot.field.to_string(),
                ty,
            })
        })
        .collect::<Result<Vec<_>, RegistryError>>()?;

    Ok(EventShape {
        name: layout.event.to_string(),
        kind: layout.kind,
        selector: event.selector(),
        event: event.clone(),
        body,
        indexed,
    })
}

fn is_word_type(ty: &DynSolType) -> bool {
    matches!(
        ty,
        DynSolType::Address
            | DynSolType::Bool
            | DynSolType::Int(_)
            | DynSolType::Uint(_)
            | DynSolType::FixedBytes(_)
    )
}
