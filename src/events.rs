use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChannelName, EntityId, EventTimestamp, Table};

/// Kind of row-level change a subscription is interested in.
///
/// `Any` is only meaningful on the subscription side; events on the wire
/// always carry a concrete kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    #[default]
    Any,
}

impl EventKind {
    /// Whether a subscription for `self` should receive an `incoming` event.
    pub fn accepts(self, incoming: EventKind) -> bool {
        self == EventKind::Any || self == incoming
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Any => "any",
        }
    }
}

/// A row-level change emitted by the backend change feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    /// The row after the change. For deletes this is the deleted row.
    pub row: Value,
    /// The row before an update, when the feed includes it.
    #[serde(default)]
    pub old_row: Option<Value>,
    pub timestamp: EventTimestamp,
}

impl ChangeEvent {
    /// Derives the entity identity from the row's primary key, if present.
    pub fn entity_id(&self) -> Option<EntityId> {
        let id = self.row.get("id")?;
        let key = match id {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        Some(EntityId::scoped(&self.table, &key))
    }
}

/// What a subscriber's callback receives.
///
/// `Resubscribed` marks the end of a reconnect: events during the disconnected
/// interval were not replayed, so consumers needing strict consistency should
/// re-fetch a snapshot when they see it.
#[derive(Clone, Debug)]
pub enum SubscriptionNotice {
    Event(ChangeEvent),
    /// A batched delivery; the array preserves original transport order.
    Batch(Vec<ChangeEvent>),
    Resubscribed(ChannelName),
    /// Terminal: the owning channel exhausted its reconnect attempts.
    Failed { channel: ChannelName, attempts: u32 },
}

/// Subscriber callback. Panics are caught at the dispatch boundary and logged;
/// they never interfere with delivery to other subscribers.
pub type EventCallback = Arc<dyn Fn(SubscriptionNotice) + Send + Sync>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_kind_accepts() {
        assert!(EventKind::Any.accepts(EventKind::Insert));
        assert!(EventKind::Any.accepts(EventKind::Delete));
        assert!(EventKind::Update.accepts(EventKind::Update));
        assert!(!EventKind::Update.accepts(EventKind::Insert));
    }

    #[test]
    fn test_entity_id_from_string_and_number_keys() {
        let event = ChangeEvent {
            table: Table::from("orders"),
            kind: EventKind::Insert,
            row: json!({"id": "ord-17", "status": "pending"}),
            old_row: None,
            timestamp: EventTimestamp::millis(1),
        };
        assert_eq!(event.entity_id(), Some(EntityId::new("orders:ord-17")));

        let event = ChangeEvent {
            table: Table::from("tables"),
            kind: EventKind::Update,
            row: json!({"id": 4, "section": "patio"}),
            old_row: None,
            timestamp: EventTimestamp::millis(1),
        };
        assert_eq!(event.entity_id(), Some(EntityId::new("tables:4")));
    }

    #[test]
    fn test_entity_id_missing_key() {
        let event = ChangeEvent {
            table: Table::from("orders"),
            kind: EventKind::Insert,
            row: json!({"status": "pending"}),
            old_row: None,
            timestamp: EventTimestamp::millis(1),
        };
        assert_eq!(event.entity_id(), None);
    }
}
