use std::collections::HashSet;

use alloy_dyn_abi::{DynSolValue, EventExt};

use crate::indexer::registry::EventShape;
use crate::models::datasets::events::DecodedEvent;
use crate::models::datasets::logs::RawLog;
use crate::models::errors::DecodeError;

/// Decodes the log against the shape's ABI entry, then assigns the payload
/// fields by name and the indexed fields by their topic positions.
pub fn decode_log(log: &RawLog, shape: &EventShape) -> Result<DecodedEvent, DecodeError> {
    let expected = shape.topic_count();
    if log.topics.len() < expected {
        return Err(DecodeError::MissingTopic {
            event: shape.name.clone(),
            index: log.topics.len(),
            available: log.topics.len(),
        });
    }

    // Topic 0 was already matched against the definition's signature
    let topics = std::iter::once(shape.selector).chain(log.topics.iter().skip(1).copied());
    let decoded = shape
        .event
        .decode_log_parts(topics, &log.data)
        .map_err(|source| DecodeError::Payload {
            event: shape.name.clone(),
            source,
        })?;

    let mut event = shape.empty();
    let mut assigned = HashSet::with_capacity(shape.body.len() + shape.indexed.len());

    for ((name, _), value) in shape.body.iter().zip(decoded.body) {
        assign(&mut event, &mut assigned, name, value)?;
    }

    // Topic n holds the n-th indexed parameter
    let mut indexed: Vec<Option<DynSolValue>> = decoded.indexed.into_iter().map(Some).collect();
    for field in &shape.indexed {
        let value = indexed
            .get_mut(field.topic - 1)
            .and_then(Option::take)
            .ok_or_else(|| DecodeError::MissingTopic {
                event: shape.name.clone(),
                index: field.topic,
                available: log.topics.len(),
            })?;
        assign(&mut event, &mut assigned, &field.field, value)?;
    }

    Ok(event)
}

fn assign<'a>(
    event: &mut DecodedEvent,
    assigned: &mut HashSet<&'a str>,
    field: &'a str,
    value: DynSolValue,
) -> Result<(), DecodeError> {
    if !assigned.insert(field) {
        return Err(DecodeError::FieldAssignedTwice {
            field: field.to_string(),
        });
    }
    event.fields_mut().assign(field, value)
}
