//! In-memory hierarchical node store
//!
//! This crate provides the MemoryNodeStore, which keeps a tree of typed
//! nodes in memory and implements the [`NodeStore`] surface the transfer
//! engine consumes. It maintains a child index for ordered traversal and
//! publishes value-changed and children-changed notifications through its
//! [`NotificationBus`].

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{debug, instrument, trace};
use xfer_core::{
    path_segments, ChildrenChangedEvent, ChildrenChangedListener, CreateNode, DeferredJob,
    HistoryOptions, ListenerId, Node, NodeId, NodeKind, NodeStore, NodeValue, Status, StoreError,
    StoreResult, ValueChangedEvent, ValueChangedListener, ValueType,
};
use xfer_event_bus::{DeferredQueue, NotificationBus};

/// Name of the root node every path starts with
pub const ROOT_NAME: &str = "Nodes";

/// The in-memory node store
///
/// The MemoryNodeStore is responsible for:
/// - Storing every node of the tree with its current value
/// - Maintaining an ordered child index per node
/// - Validating writes against declared value types and read-only flags
/// - Publishing notifications after its internal locks are released
pub struct MemoryNodeStore {
    /// All nodes keyed by identity
    nodes: DashMap<NodeId, Node>,
    /// Ordered child identities per parent
    children_index: DashMap<NodeId, Vec<NodeId>>,
    /// Nodes with an implicit subscription
    subscriptions: DashSet<NodeId>,
    /// Identity of the root node
    root: NodeId,
    /// Listener registry and change stream
    bus: Arc<NotificationBus>,
    /// Continuations run outside of notifications
    deferred: DeferredQueue,
}

impl MemoryNodeStore {
    /// Create a store containing only the root node
    pub fn new() -> Self {
        Self::with_bus(Arc::new(NotificationBus::new()))
    }

    /// Create a store publishing on the given bus
    pub fn with_bus(bus: Arc<NotificationBus>) -> Self {
        let root = Node {
            id: NodeId::new(),
            name: ROOT_NAME.to_string(),
            parent: None,
            kind: NodeKind::Folder,
            value_type: None,
            location: None,
            is_read_only: false,
            history: HistoryOptions::Inactive,
            value: None,
        };
        let root_id = root.id.clone();

        let nodes = DashMap::new();
        nodes.insert(root_id.clone(), root);

        Self {
            nodes,
            children_index: DashMap::new(),
            subscriptions: DashSet::new(),
            root: root_id,
            bus,
            deferred: DeferredQueue::new(),
        }
    }

    /// Create a shared store
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The bus notifications are published on
    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// Total number of nodes, including the root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether an implicit subscription was created for a node
    pub fn is_subscribed(&self, id: &NodeId) -> bool {
        self.subscriptions.contains(id)
    }

    /// Create a folder below `parent`
    pub fn create_folder(&self, parent: &NodeId, name: &str) -> StoreResult<Node> {
        self.create_node(CreateNode::folder(parent.clone(), name))
    }

    /// Create a value node below `parent`
    pub fn create_value(
        &self,
        parent: &NodeId,
        name: &str,
        value_type: ValueType,
    ) -> StoreResult<Node> {
        self.create_node(CreateNode::value(parent.clone(), name, value_type))
    }

    /// Resolve a folder path, creating missing folders along the way
    pub fn ensure_folder_path(&self, path: &str) -> StoreResult<Node> {
        let segments = path_segments(path);
        let mut rest = segments.as_slice();
        if rest.first() == Some(&ROOT_NAME) {
            rest = &rest[1..];
        }

        let mut current = self
            .node(&self.root)
            .ok_or_else(|| StoreError::NodeNotFound(self.root.clone()))?;

        for segment in rest {
            current = match self.child(&current.id, segment) {
                Some(existing) => existing,
                None => self.create_folder(&current.id, segment)?,
            };
        }
        Ok(current)
    }

    /// Set a node's value as a producer would, including its status
    ///
    /// Unlike [`NodeStore::write_values`] this does not validate the value
    /// against the node's type or read-only flag.
    #[instrument(skip(self, value), fields(node = %id))]
    pub fn set_value(&self, id: &NodeId, value: NodeValue) -> StoreResult<()> {
        let old_value = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
            node.value.replace(value.clone())
        };

        trace!(bad = value.status.is_bad, "Setting node value");
        self.bus
            .publish_value_changed(ValueChangedEvent::new(id.clone(), old_value, Some(value)));
        Ok(())
    }

    /// Clear a node's value
    pub fn clear_value(&self, id: &NodeId) -> StoreResult<()> {
        let old_value = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
            node.value.take()
        };

        if old_value.is_some() {
            self.bus
                .publish_value_changed(ValueChangedEvent::new(id.clone(), old_value, None));
        }
        Ok(())
    }

    /// Change the location hint of a node
    pub fn set_location(&self, id: &NodeId, location: Option<&str>) -> StoreResult<()> {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        node.location = location.map(str::to_string);
        Ok(())
    }

    /// Change the declared value type of a node
    pub fn set_value_type(&self, id: &NodeId, value_type: Option<ValueType>) -> StoreResult<()> {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        node.value_type = value_type;
        Ok(())
    }

    /// Change the read-only flag of a node
    pub fn set_read_only(&self, id: &NodeId, read_only: bool) -> StoreResult<()> {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        node.is_read_only = read_only;
        Ok(())
    }

    /// Remove a node and everything below it
    ///
    /// Listeners registered on removed nodes are dropped. A single
    /// children-changed notification is published on the parent.
    #[instrument(skip(self), fields(node = %id))]
    pub fn remove_node(&self, id: &NodeId) -> StoreResult<Node> {
        let node = self
            .node(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        let parent = node.parent.clone().ok_or(StoreError::CannotRemoveRoot)?;

        let mut pending = vec![id.clone()];
        let mut removed = 0usize;
        while let Some(current) = pending.pop() {
            if let Some((_, children)) = self.children_index.remove(&current) {
                pending.extend(children);
            }
            self.nodes.remove(&current);
            self.subscriptions.remove(&current);
            self.bus.clear_node(&current);
            removed += 1;
        }

        if let Some(mut siblings) = self.children_index.get_mut(&parent) {
            siblings.retain(|c| c != id);
        }

        debug!(removed, "Removed node subtree");
        self.bus
            .publish_children_changed(ChildrenChangedEvent::removed(parent, node.clone()));
        Ok(node)
    }

    /// Validate and apply one write, returning its status and the change to publish
    fn apply_write(
        &self,
        id: &NodeId,
        value: serde_json::Value,
    ) -> (Status, Option<ValueChangedEvent>) {
        let Some(mut node) = self.nodes.get_mut(id) else {
            return (Status::bad("Node not found"), None);
        };

        if !node.kind.is_value() {
            return (Status::bad("Node is not a value node"), None);
        }
        if node.is_read_only {
            return (Status::bad("Node is read-only"), None);
        }
        if let Some(value_type) = node.value_type {
            if !value_type.accepts(&value) {
                return (
                    Status::bad(format!(
                        "Value {} is not compatible with type {:?}{}",
                        value,
                        value_type.type_code,
                        if value_type.is_array { "[]" } else { "" }
                    )),
                    None,
                );
            }
        }

        let new_value = NodeValue::new(value);
        let old_value = node.value.replace(new_value.clone());
        (
            Status::good(),
            Some(ValueChangedEvent::new(id.clone(), old_value, Some(new_value))),
        )
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    fn root_id(&self) -> NodeId {
        self.root.clone()
    }

    fn node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).map(|n| n.clone())
    }

    fn node_path(&self, id: &NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(id.clone());
        while let Some(cid) = current {
            let node = self.nodes.get(&cid)?;
            names.push(node.name.clone());
            current = node.parent.clone();
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    fn find_node(&self, path: &str) -> Option<Node> {
        let segments = path_segments(path);
        let (first, rest) = segments.split_first()?;
        if *first != ROOT_NAME {
            return None;
        }

        let mut current = self.node(&self.root)?;
        for segment in rest {
            current = self.child(&current.id, segment)?;
        }
        Some(current)
    }

    fn children(&self, id: &NodeId) -> Vec<Node> {
        let ids = self
            .children_index
            .get(id)
            .map(|c| c.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|cid| self.node(cid)).collect()
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, parent = %spec.parent))]
    fn create_node(&self, spec: CreateNode) -> StoreResult<Node> {
        if spec.name.is_empty() || spec.name.contains(xfer_core::PATH_SEPARATOR) {
            return Err(StoreError::InvalidName(spec.name));
        }
        if !self.nodes.contains_key(&spec.parent) {
            return Err(StoreError::ParentNotFound(spec.parent));
        }
        if spec.kind.is_value() && spec.value_type.is_none() {
            return Err(StoreError::MissingValueType { name: spec.name });
        }

        let node = Node {
            id: NodeId::new(),
            name: spec.name,
            parent: Some(spec.parent.clone()),
            kind: spec.kind,
            value_type: spec.value_type,
            location: spec.location,
            is_read_only: spec.is_read_only,
            history: spec.history,
            value: None,
        };

        {
            let mut siblings = self.children_index.entry(spec.parent.clone()).or_default();
            let duplicate = siblings.iter().any(|cid| {
                self.nodes
                    .get(cid)
                    .map(|n| n.name == node.name)
                    .unwrap_or(false)
            });
            if duplicate {
                return Err(StoreError::DuplicateName {
                    parent: spec.parent,
                    name: node.name,
                });
            }
            self.nodes.insert(node.id.clone(), node.clone());
            siblings.push(node.id.clone());
        }

        debug!(kind = ?node.kind, "Created node");
        self.bus
            .publish_children_changed(ChildrenChangedEvent::added(spec.parent, node.clone()));
        Ok(node)
    }

    async fn read_values(&self, ids: &[NodeId]) -> Vec<Option<NodeValue>> {
        tokio::task::yield_now().await;
        ids.iter()
            .map(|id| self.nodes.get(id).and_then(|n| n.value.clone()))
            .collect()
    }

    async fn write_values(&self, writes: Vec<(NodeId, serde_json::Value)>) -> Vec<Status> {
        tokio::task::yield_now().await;
        let mut statuses = Vec::with_capacity(writes.len());
        for (id, value) in writes {
            let (status, event) = self.apply_write(&id, value);
            if let Some(event) = event {
                self.bus.publish_value_changed(event);
            }
            statuses.push(status);
        }
        statuses
    }

    fn on_value_changed(
        &self,
        id: &NodeId,
        listener: ValueChangedListener,
        create_implicit_subscription: bool,
    ) -> ListenerId {
        if create_implicit_subscription {
            self.subscriptions.insert(id.clone());
        }
        self.bus.on_value_changed(id, listener)
    }

    fn off_value_changed(&self, id: &NodeId, listener: ListenerId) {
        self.bus.off_value_changed(id, listener);
    }

    fn on_children_changed(&self, id: &NodeId, listener: ChildrenChangedListener) -> ListenerId {
        self.bus.on_children_changed(id, listener)
    }

    fn off_children_changed(&self, id: &NodeId, listener: ListenerId) {
        self.bus.off_children_changed(id, listener);
    }

    fn schedule_deferred(&self, job: DeferredJob) {
        self.deferred.schedule(job);
    }
}

/// Thread-safe wrapper for MemoryNodeStore
pub type SharedMemoryNodeStore = Arc<MemoryNodeStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use xfer_core::TypeCode;

    fn make_tree() -> (MemoryNodeStore, Node) {
        let store = MemoryNodeStore::new();
        let folder = store.ensure_folder_path("/Nodes/Transfers").unwrap();
        (store, folder)
    }

    #[test]
    fn test_find_node_by_path() {
        let (store, folder) = make_tree();
        let value = store
            .create_value(&folder.id, "Count", ValueType::scalar(TypeCode::Int32))
            .unwrap();

        assert_eq!(store.find_node("/Nodes/Transfers/Count").unwrap().id, value.id);
        assert_eq!(store.find_node("Nodes/Transfers/").unwrap().id, folder.id);
        assert!(store.find_node("/Nodes/Missing").is_none());
        assert!(store.find_node("/Other/Transfers").is_none());
        assert_eq!(
            store.node_path(&value.id).as_deref(),
            Some("/Nodes/Transfers/Count")
        );
    }

    #[test]
    fn test_find_node_required() {
        let (store, _) = make_tree();
        let err = store.find_node_required("/Nodes/Nope").unwrap_err();
        assert_eq!(err, StoreError::PathNotFound("/Nodes/Nope".to_string()));
    }

    #[test]
    fn test_ensure_folder_path_is_idempotent() {
        let (store, folder) = make_tree();
        let count = store.node_count();
        let again = store.ensure_folder_path("/Nodes/Transfers/").unwrap();
        assert_eq!(again.id, folder.id);
        assert_eq!(store.node_count(), count);
    }

    #[test]
    fn test_create_node_validation() {
        let (store, folder) = make_tree();

        let missing_type = store.create_node(CreateNode {
            value_type: None,
            ..CreateNode::value(folder.id.clone(), "X", ValueType::boolean())
        });
        assert!(matches!(missing_type, Err(StoreError::MissingValueType { .. })));

        store.create_folder(&folder.id, "Inputs").unwrap();
        let duplicate = store.create_folder(&folder.id, "Inputs");
        assert!(matches!(duplicate, Err(StoreError::DuplicateName { .. })));

        let bad_name = store.create_folder(&folder.id, "a/b");
        assert!(matches!(bad_name, Err(StoreError::InvalidName(_))));

        let orphan = store.create_folder(&NodeId::new(), "Orphan");
        assert!(matches!(orphan, Err(StoreError::ParentNotFound(_))));
    }

    #[test]
    fn test_children_keep_creation_order() {
        let (store, folder) = make_tree();
        for name in ["c", "a", "b"] {
            store
                .create_value(&folder.id, name, ValueType::boolean())
                .unwrap();
        }
        let names: Vec<String> = store
            .children(&folder.id)
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_children_changed_notifications() {
        let (store, folder) = make_tree();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        store.on_children_changed(
            &folder.id,
            Arc::new(move |e: &ChildrenChangedEvent| {
                let mut seen = sink.lock().unwrap();
                for n in &e.added {
                    seen.push(format!("+{}", n.name));
                }
                for n in &e.removed {
                    seen.push(format!("-{}", n.name));
                }
            }),
        );

        let a = store.create_folder(&folder.id, "A").unwrap();
        store.create_folder(&a.id, "Nested").unwrap();
        store.remove_node(&a.id).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["+A", "-A"]);
        assert!(store.find_node("/Nodes/Transfers/A/Nested").is_none());
        assert!(store.children(&folder.id).is_empty());
    }

    #[test]
    fn test_cannot_remove_root() {
        let store = MemoryNodeStore::new();
        let root = store.root_id();
        assert_eq!(store.remove_node(&root), Err(StoreError::CannotRemoveRoot));
    }

    #[tokio::test]
    async fn test_write_and_read_values() {
        let (store, folder) = make_tree();
        let flag = store
            .create_value(&folder.id, "Flag", ValueType::boolean())
            .unwrap();
        let count = store
            .create_value(&folder.id, "Count", ValueType::scalar(TypeCode::UInt16))
            .unwrap();

        let statuses = store
            .write_values(vec![
                (flag.id.clone(), json!(true)),
                (count.id.clone(), json!(-1)),
                (folder.id.clone(), json!(1)),
                (NodeId::new(), json!(1)),
            ])
            .await;

        assert!(statuses[0].is_good());
        assert!(statuses[1].is_bad);
        assert_eq!(statuses[2].status_text.as_deref(), Some("Node is not a value node"));
        assert_eq!(statuses[3].status_text.as_deref(), Some("Node not found"));

        let values = store.read_values(&[flag.id.clone(), count.id.clone()]).await;
        assert_eq!(values[0].as_ref().unwrap().value, json!(true));
        assert!(values[1].is_none());
    }

    #[tokio::test]
    async fn test_read_only_write_is_rejected() {
        let (store, folder) = make_tree();
        let node = store
            .create_node(
                CreateNode::value(folder.id.clone(), "Locked", ValueType::boolean()).read_only(),
            )
            .unwrap();

        let status = store.write_value(&node.id, json!(true)).await;
        assert_eq!(status.status_text.as_deref(), Some("Node is read-only"));
        assert!(store.node(&node.id).unwrap().value.is_none());
    }

    #[tokio::test]
    async fn test_bad_status_is_readable() {
        let (store, folder) = make_tree();
        let node = store
            .create_value(&folder.id, "Sensor", ValueType::scalar(TypeCode::Double))
            .unwrap();
        store
            .set_value(&node.id, NodeValue::bad(json!(0.0), "Device offline"))
            .unwrap();

        let values = store.read_values(&[node.id.clone()]).await;
        let value = values[0].as_ref().unwrap();
        assert!(value.status.is_bad);
        assert_eq!(value.status.text(), "Device offline");
    }

    #[tokio::test]
    async fn test_value_listener_sees_old_and_new() {
        let (store, folder) = make_tree();
        let node = store
            .create_value(&folder.id, "Flag", ValueType::boolean())
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = store.on_value_changed(
            &node.id,
            Arc::new(move |e: &ValueChangedEvent| {
                sink.lock().unwrap().push((e.old_bool(), e.new_bool()));
            }),
            true,
        );
        assert!(store.is_subscribed(&node.id));

        store.write_value(&node.id, json!(false)).await;
        store.write_value(&node.id, json!(true)).await;
        store.off_value_changed(&node.id, id);
        store.write_value(&node.id, json!(false)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(None, Some(false)), (Some(false), Some(true))]
        );
    }

    #[test]
    fn test_remove_drops_listeners() {
        let (store, folder) = make_tree();
        let node = store
            .create_value(&folder.id, "Flag", ValueType::boolean())
            .unwrap();
        store.on_value_changed(&node.id, Arc::new(|_: &ValueChangedEvent| {}), false);
        assert_eq!(store.bus().value_listener_count(&node.id), 1);

        store.remove_node(&node.id).unwrap();
        assert_eq!(store.bus().value_listener_count(&node.id), 0);
    }

    #[test]
    fn test_set_value_is_visible_to_reads() {
        let (store, folder) = make_tree();
        let level = store
            .create_value(&folder.id, "Level", ValueType::scalar(TypeCode::Double))
            .unwrap();
        store
            .set_value(&level.id, NodeValue::bad(json!(3.5), "Uncertain"))
            .unwrap();

        let values = tokio_test::block_on(store.read_values(&[level.id.clone()]));
        let value = values[0].as_ref().unwrap();
        assert_eq!(value.value, json!(3.5));
        assert_eq!(value.status.text(), "Uncertain");
    }
}
