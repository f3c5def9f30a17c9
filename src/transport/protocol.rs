//! JSON frame protocol of the push connection.
//!
//! Inbound frames are `{"event": "<resource>:<kind>", "data": ...}`. Outbound
//! requests use the same envelope, e.g. `{"event": "subscribe"}`.
//!
//! Payload shapes per kind:
//! - `new`: the item itself, or `{"item": {...}, ...}`
//! - `patch`: `{"id": .., "fields": {...}}`, or the changed fields next to `id`
//! - `delete`: `{"id": ..}` or a bare id
//! - `counter`: `{"value": n}` or a bare number
//! - `bulk-cleared`: anything
//!
//! Scalar top-level payload fields other than the ones above become the event
//! scope (e.g. `movieId`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::cache::{Item, ItemId};
use crate::events::{EventKind, Resource};

/// Maximum accepted frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload fields with a fixed meaning; never part of the scope
const RESERVED_FIELDS: [&str; 4] = ["id", "item", "fields", "value"];

/// Requests sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start receiving events for the authenticated user
    Subscribe,
    Unsubscribe,
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFormat(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// A decoded inbound frame, not yet sequenced
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub resource: Resource,
    pub kind: EventKind,
    pub scope: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

pub fn encode_client(message: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one text frame
pub fn decode_event(text: &str) -> Result<DecodedEvent, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len()));
    }

    let Envelope { event, data } = serde_json::from_str(text)?;

    let (resource, kind) = event
        .split_once(':')
        .ok_or_else(|| ProtocolError::UnknownEvent(event.clone()))?;
    let resource = Resource::from_name(resource).ok_or_else(|| ProtocolError::UnknownEvent(event.clone()))?;

    let kind = match kind {
        "new" => decode_new(&data)?,
        "patch" => decode_patch(&data)?,
        "delete" => EventKind::Delete {
            id: decode_id(&data)?,
        },
        "counter" => EventKind::Counter {
            value: decode_counter(&data)?,
        },
        "bulk-cleared" => EventKind::BulkCleared,
        _ => return Err(ProtocolError::UnknownEvent(event)),
    };

    Ok(DecodedEvent {
        resource,
        kind,
        scope: scope_of(&data),
    })
}

fn decode_new(data: &Value) -> Result<EventKind, ProtocolError> {
    let item_value = match data.get("item") {
        Some(item) if item.is_object() => item.clone(),
        _ => data.clone(),
    };
    if !item_value.is_object() {
        return Err(ProtocolError::InvalidFormat("new event without an item".to_string()));
    }
    let item: Item = serde_json::from_value(item_value)?;
    Ok(EventKind::New { item })
}

fn decode_patch(data: &Value) -> Result<EventKind, ProtocolError> {
    let id = decode_id(data)?;
    let fields = match data.get("fields") {
        Some(Value::Object(fields)) => fields.clone(),
        _ => match data {
            Value::Object(object) => object
                .iter()
                .filter(|(name, _)| name.as_str() != "id")
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
            _ => return Err(ProtocolError::InvalidFormat("patch payload must be an object".to_string())),
        },
    };
    Ok(EventKind::Patch { id, fields })
}

fn decode_id(data: &Value) -> Result<ItemId, ProtocolError> {
    let raw = match data {
        Value::Object(object) => object
            .get("id")
            .ok_or_else(|| ProtocolError::InvalidFormat("missing id".to_string()))?,
        other => other,
    };
    Ok(serde_json::from_value(raw.clone())?)
}

fn decode_counter(data: &Value) -> Result<i64, ProtocolError> {
    let raw = match data {
        Value::Object(object) => object.get("value").unwrap_or(&Value::Null),
        other => other,
    };
    raw.as_i64()
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("counter value {} is not an integer", raw)))
}

fn scope_of(data: &Value) -> BTreeMap<String, String> {
    let Value::Object(object) = data else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
        .filter_map(|(name, value)| match value {
            Value::String(s) => Some((name.clone(), s.clone())),
            Value::Number(n) => Some((name.clone(), n.to_string())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame() {
        assert_eq!(encode_client(&ClientMessage::Subscribe).unwrap(), r#"{"event":"subscribe"}"#);
    }

    #[test]
    fn test_decode_new_comment_with_scope() {
        let decoded = decode_event(
            r#"{"event":"comment:new","data":{"id":5,"text":"hi","movieId":7,"parentId":"1"}}"#,
        )
        .unwrap();

        assert_eq!(decoded.resource, Resource::Comment);
        let EventKind::New { item } = decoded.kind else {
            panic!("expected new");
        };
        assert_eq!(item.id, ItemId::from("5"));
        assert_eq!(item.parent_id(), Some(ItemId::from("1")));
        assert_eq!(decoded.scope.get("movieId").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_decode_patch_shapes() {
        let nested = decode_event(r#"{"event":"notification:patch","data":{"id":"3","fields":{"isRead":true}}}"#).unwrap();
        let flat = decode_event(r#"{"event":"notification:patch","data":{"id":"3","isRead":true}}"#).unwrap();
        assert_eq!(nested.kind, flat.kind);

        let EventKind::Patch { id, fields } = nested.kind else {
            panic!("expected patch");
        };
        assert_eq!(id, ItemId::from(3));
        assert_eq!(fields.get("isRead"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_decode_counter_and_delete() {
        let counter = decode_event(r#"{"event":"notification:counter","data":{"value":4}}"#).unwrap();
        assert_eq!(counter.kind, EventKind::Counter { value: 4 });

        let bare = decode_event(r#"{"event":"friendship:counter","data":2}"#).unwrap();
        assert_eq!(bare.kind, EventKind::Counter { value: 2 });

        let delete = decode_event(r#"{"event":"friendships:delete","data":{"id":9}}"#).unwrap();
        assert_eq!(delete.resource, Resource::Friendship);
        assert_eq!(delete.kind, EventKind::Delete { id: ItemId::from("9") });
    }

    #[test]
    fn test_decode_bulk_cleared_without_data() {
        let decoded = decode_event(r#"{"event":"notification:bulk-cleared"}"#).unwrap();
        assert_eq!(decoded.kind, EventKind::BulkCleared);
        assert!(decoded.scope.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(matches!(
            decode_event(r#"{"event":"story:new","data":{"id":1}}"#),
            Err(ProtocolError::UnknownEvent(_))
        ));
        assert!(matches!(
            decode_event(r#"{"event":"notification:archive","data":{}}"#),
            Err(ProtocolError::UnknownEvent(_))
        ));
        assert!(matches!(
            decode_event(r#"{"event":"notification:delete","data":{}}"#),
            Err(ProtocolError::InvalidFormat(_))
        ));
        assert!(matches!(decode_event("not json"), Err(ProtocolError::Json(_))));
    }
}
