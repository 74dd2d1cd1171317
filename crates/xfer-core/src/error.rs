//! Errors raised synchronously by store operations

use thiserror::Error;

use crate::node::NodeId;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Misuse of the store surface
///
/// Value quality problems are never reported through this type; reads and
/// writes surface them as [`Status`](crate::Status) data instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("no node at path '{0}'")]
    PathNotFound(String),

    #[error("parent node not found: {0}")]
    ParentNotFound(NodeId),

    #[error("creating value node '{name}' requires a value type")]
    MissingValueType { name: String },

    #[error("a node named '{name}' already exists below {parent}")]
    DuplicateName { parent: NodeId, name: String },

    #[error("invalid node name '{0}'")]
    InvalidName(String),

    #[error("the root node cannot be removed")]
    CannotRemoveRoot,
}
