//! Core types for the transfer engine
//!
//! This crate provides the fundamental types shared by every other crate:
//! the node model of the hierarchical store (NodeId, Node, ValueType,
//! NodeValue, Status), the notification payloads, and the [`NodeStore`]
//! trait describing the capabilities the engine consumes.

mod error;
mod event;
mod node;
mod store;
mod value;

pub use error::{StoreError, StoreResult};
pub use event::{ChildrenChangedEvent, ListenerId, Published, StoreEvent, ValueChangedEvent};
pub use node::{CreateNode, HistoryOptions, Node, NodeId, NodeKind};
pub use store::{
    ChildrenChangedListener, DeferredJob, NodeStore, SharedNodeStore, ValueChangedListener,
};
pub use value::{NodeValue, Status, TypeCode, ValueType};

/// Path separator used in node paths
pub const PATH_SEPARATOR: char = '/';

/// Split a node path into its non-empty segments
///
/// Leading, trailing and repeated separators are ignored, so `/Nodes/A/`
/// and `Nodes//A` both yield `["Nodes", "A"]`.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR)
        .filter(|s| !s.is_empty())
        .collect()
}
