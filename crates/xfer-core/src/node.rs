//! Node types representing locations in the hierarchical store

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::value::{NodeValue, ValueType};

/// Stable identity of a node
///
/// Identities are ULIDs assigned by the store when the node is created. They
/// never change, even if the node is renamed or moved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a fresh node identity
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an existing identity string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// Kind of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain folder grouping other nodes
    Folder,
    /// Directory mounted from an external source
    Directory,
    /// Callable method node
    Method,
    /// File node
    File,
    /// Node carrying a typed value
    Value,
}

impl NodeKind {
    pub fn is_folder(&self) -> bool {
        matches!(self, NodeKind::Folder)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, NodeKind::Value)
    }
}

/// History recording options of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOptions {
    /// No history values are recorded
    #[default]
    Inactive,
    /// A history value is recorded on every write
    Active,
    /// A history value is recorded only when the value differs from the last one
    ValueChange,
    /// Like `Active`, with a background subscription reading the source
    Subscription,
}

/// Snapshot of a node at the time it was looked up
///
/// Nodes are plain data; the store is the single source of truth. Anything
/// that must reflect the current tree (children, value, value type) has to
/// be looked up again through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identity
    pub id: NodeId,

    /// Name, unique among siblings
    pub name: String,

    /// Parent identity (`None` for the root)
    pub parent: Option<NodeId>,

    /// Kind of node
    pub kind: NodeKind,

    /// Declared value type (value nodes only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,

    /// Free-form location hint attached to the node (e.g. "toggle", "group")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Whether writes to the node are rejected
    #[serde(default)]
    pub is_read_only: bool,

    /// History recording options
    #[serde(default)]
    pub history: HistoryOptions,

    /// Current value, if the node has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<NodeValue>,
}

impl Node {
    /// Check whether the location hint equals `hint`, ignoring case
    pub fn has_location(&self, hint: &str) -> bool {
        self.location
            .as_deref()
            .map(|l| l.eq_ignore_ascii_case(hint))
            .unwrap_or(false)
    }

    /// Current boolean value, if the node holds one
    pub fn bool_value(&self) -> Option<bool> {
        self.value.as_ref().and_then(NodeValue::as_bool)
    }

    /// Current numeric value, if the node holds one
    pub fn f64_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(NodeValue::as_f64)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Description of a node to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNode {
    pub name: String,
    pub parent: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub history: HistoryOptions,
}

impl CreateNode {
    /// Describe a folder node
    pub fn folder(parent: NodeId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent,
            kind: NodeKind::Folder,
            value_type: None,
            location: None,
            is_read_only: false,
            history: HistoryOptions::Inactive,
        }
    }

    /// Describe a value node of the given type
    pub fn value(parent: NodeId, name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            parent,
            kind: NodeKind::Value,
            value_type: Some(value_type),
            location: None,
            is_read_only: false,
            history: HistoryOptions::Inactive,
        }
    }

    /// Attach a location hint
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Mark the node read-only
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Set history options
    pub fn with_history(mut self, history: HistoryOptions) -> Self {
        self.history = history;
        self
    }
}
