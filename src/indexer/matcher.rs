use tracing::warn;

use crate::indexer::registry::{EventShape, FamilyRegistry};
use crate::models::datasets::logs::{EventDefinition, RawLog};
use crate::models::errors::LogError;

/// Pairs a log with the definition whose signature equals its topic[0], and
/// with the decoded shape registered for that definition's event name.
pub fn match_log<'a>(
    log: &RawLog,
    definitions: &'a [EventDefinition],
    family: &'a FamilyRegistry,
) -> Result<(&'a EventDefinition, &'a EventShape), LogError> {
    let signature = log.signature().ok_or(LogError::NoTopics)?;

    let mut candidates = definitions
        .iter()
        .filter(|definition| definition.signature == signature);
    let definition = candidates
        .next()
        .ok_or(LogError::Unmatched { signature })?;

    let duplicates = candidates.count();
    if duplicates > 0 {
        warn!(
            "Signature {} is registered by {} more definitions, using {} ({})",
            signature, duplicates, definition.name, definition.id
        );
    }

    let shape = family
        .shape(&definition.name)
        .ok_or_else(|| LogError::UnknownEvent {
            family: family.family,
            event: definition.name.clone(),
        })?;

    Ok((definition, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, Bytes, keccak256};
    use uuid::Uuid;

    use crate::indexer::registry::EventRegistry;
    use crate::models::common::EventFamily;
    use crate::models::datasets::logs::ContractRef;

    fn definition(name: &str, signature: B256) -> EventDefinition {
        EventDefinition {
            id: Uuid::now_v7(),
            contract: ContractRef {
                id: Uuid::now_v7(),
                address: Address::repeat_byte(0xaa),
                family: EventFamily::Erc20,
            },
            name: name.to_string(),
            signature,
        }
    }

    fn log_with_topics(topics: Vec<B256>) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xaa),
            topics,
            data: Bytes::new(),
            block_number: 1,
            block_hash: Some(B256::repeat_byte(0x01)),
            transaction_hash: B256::repeat_byte(0x02),
            transaction_index: Some(0),
            log_index: 0,
        }
    }

    #[test]
    fn test_matches_by_signature() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let transfer = keccak256("Transfer(address,address,uint256)");
        let approval = keccak256("Approval(address,address,uint256)");
        let definitions = vec![definition("Transfer", transfer), definition("Approval", approval)];

        let (matched, shape) =
            match_log(&log_with_topics(vec![approval]), &definitions, erc20).unwrap();
        assert_eq!(matched.name, "Approval");
        assert_eq!(shape.name, "Approval");
    }

    #[test]
    fn test_unmatched_signature_is_a_skip() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let definitions = vec![definition(
            "Transfer",
            keccak256("Transfer(address,address,uint256)"),
        )];

        let err = match_log(
            &log_with_topics(vec![B256::repeat_byte(0x99)]),
            &definitions,
            erc20,
        )
        .unwrap_err();
        assert!(err.is_skip());
        assert!(matches!(err, LogError::Unmatched { .. }));
    }

    #[test]
    fn test_log_without_topics_is_a_skip() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let err = match_log(&log_with_topics(vec![]), &[], erc20).unwrap_err();
        assert!(matches!(err, LogError::NoTopics));
    }

    #[test]
    fn test_event_outside_family_is_a_skip() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let swap = keccak256("Swap(address,address,int256,int256,uint160,uint128,int24)");
        let definitions = vec![definition("Swap", swap)];

        let err = match_log(&log_with_topics(vec![swap]), &definitions, erc20).unwrap_err();
        assert!(err.is_skip());
        assert!(matches!(err, LogError::UnknownEvent { .. }));
    }

    #[test]
    fn test_first_definition_wins_on_duplicate_signature() {
        let registry = EventRegistry::build().unwrap();
        let erc20 = registry.family(EventFamily::Erc20).unwrap();
        let transfer = keccak256("Transfer(address,address,uint256)");
        let definitions = vec![definition("Transfer", transfer), definition("Transfer", transfer)];

        let (matched, _) =
            match_log(&log_with_topics(vec![transfer]), &definitions, erc20).unwrap();
        assert_eq!(matched.id, definitions[0].id);
    }
}
