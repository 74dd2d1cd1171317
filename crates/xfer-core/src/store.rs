//! The capability surface the engine requires from a hierarchical store

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::event::{ChildrenChangedEvent, ListenerId, ValueChangedEvent};
use crate::node::{CreateNode, Node, NodeId};
use crate::value::{NodeValue, Status};

/// Callback invoked for value changes of one node
pub type ValueChangedListener = Arc<dyn Fn(&ValueChangedEvent) + Send + Sync + 'static>;

/// Callback invoked for structural changes below one node
pub type ChildrenChangedListener = Arc<dyn Fn(&ChildrenChangedEvent) + Send + Sync + 'static>;

/// Zero-argument continuation run outside of any notification
pub type DeferredJob = Box<dyn FnOnce() + Send + 'static>;

/// A hierarchical store of typed nodes
///
/// Notifications are delivered synchronously and in the order the underlying
/// changes occurred. Listeners may read the store and (un)register listeners,
/// but must not mutate the tree; mutation has to go through
/// [`schedule_deferred`](NodeStore::schedule_deferred).
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Identity of the root node
    fn root_id(&self) -> NodeId;

    /// Current snapshot of a node
    fn node(&self, id: &NodeId) -> Option<Node>;

    /// Human path of a node (e.g. `/Nodes/Transfers/A`)
    fn node_path(&self, id: &NodeId) -> Option<String>;

    /// Resolve a node by path
    fn find_node(&self, path: &str) -> Option<Node>;

    /// Resolve a node by path, failing if it does not exist
    fn find_node_required(&self, path: &str) -> StoreResult<Node> {
        self.find_node(path)
            .ok_or_else(|| StoreError::PathNotFound(path.to_string()))
    }

    /// Current children of a node in their stored order
    fn children(&self, id: &NodeId) -> Vec<Node>;

    /// Find a direct child by name
    fn child(&self, id: &NodeId, name: &str) -> Option<Node> {
        self.children(id).into_iter().find(|c| c.name == name)
    }

    /// Create a new node
    fn create_node(&self, spec: CreateNode) -> StoreResult<Node>;

    /// Read values of several nodes, one result per requested node
    async fn read_values(&self, ids: &[NodeId]) -> Vec<Option<NodeValue>>;

    /// Write several values, one status per requested write
    async fn write_values(&self, writes: Vec<(NodeId, serde_json::Value)>) -> Vec<Status>;

    /// Write a single value
    async fn write_value(&self, id: &NodeId, value: serde_json::Value) -> Status {
        self.write_values(vec![(id.clone(), value)])
            .await
            .pop()
            .unwrap_or_else(|| Status::bad("no write result"))
    }

    /// Listen for value changes of a node
    fn on_value_changed(
        &self,
        id: &NodeId,
        listener: ValueChangedListener,
        create_implicit_subscription: bool,
    ) -> ListenerId;

    /// Remove a value change listener
    fn off_value_changed(&self, id: &NodeId, listener: ListenerId);

    /// Listen for children being added to or removed from a node
    fn on_children_changed(&self, id: &NodeId, listener: ChildrenChangedListener) -> ListenerId;

    /// Remove a children change listener
    fn off_children_changed(&self, id: &NodeId, listener: ListenerId);

    /// Run `job` as soon as possible outside the current notification
    fn schedule_deferred(&self, job: DeferredJob);
}

/// Thread-safe handle to a store
pub type SharedNodeStore = Arc<dyn NodeStore>;
