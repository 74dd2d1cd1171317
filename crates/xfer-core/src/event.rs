//! Notification payloads delivered by the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeId};
use crate::value::NodeValue;

/// A unique identifier for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wrap a raw listener number handed out by a registry
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Payload of a value change on a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChangedEvent {
    pub node_id: NodeId,
    pub old_value: Option<NodeValue>,
    pub new_value: Option<NodeValue>,
    /// Whether the raw value differs (a rewrite of the same value reports `false`)
    pub is_value_changed: bool,
}

impl ValueChangedEvent {
    /// Build an event, deriving `is_value_changed` from the two values
    pub fn new(node_id: NodeId, old_value: Option<NodeValue>, new_value: Option<NodeValue>) -> Self {
        let is_value_changed = match (&old_value, &new_value) {
            (Some(old), Some(new)) => old.value != new.value,
            (None, None) => false,
            _ => true,
        };
        Self {
            node_id,
            old_value,
            new_value,
            is_value_changed,
        }
    }

    pub fn old_bool(&self) -> Option<bool> {
        self.old_value.as_ref().and_then(NodeValue::as_bool)
    }

    pub fn new_bool(&self) -> Option<bool> {
        self.new_value.as_ref().and_then(NodeValue::as_bool)
    }
}

/// Payload of a structural change below a parent node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenChangedEvent {
    pub parent: NodeId,
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
}

impl ChildrenChangedEvent {
    pub fn added(parent: NodeId, node: Node) -> Self {
        Self {
            parent,
            added: vec![node],
            removed: Vec::new(),
        }
    }

    pub fn removed(parent: NodeId, node: Node) -> Self {
        Self {
            parent,
            added: Vec::new(),
            removed: vec![node],
        }
    }
}

/// Any change made to the store, as published on the change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    ValueChanged(ValueChangedEvent),
    ChildrenChanged(ChildrenChangedEvent),
}

impl StoreEvent {
    /// Node the event was raised on
    pub fn node_id(&self) -> &NodeId {
        match self {
            StoreEvent::ValueChanged(e) => &e.node_id,
            StoreEvent::ChildrenChanged(e) => &e.parent,
        }
    }
}

/// A change event stamped with the time it was published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Published<T> {
    pub event: T,
    pub time_fired: DateTime<Utc>,
}

impl<T> Published<T> {
    pub fn now(event: T) -> Self {
        Self {
            event,
            time_fired: Utc::now(),
        }
    }
}
