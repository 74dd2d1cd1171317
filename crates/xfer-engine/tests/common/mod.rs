//! Shared test utilities for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xfer_core::{
    ChildrenChangedListener, CreateNode, DeferredJob, ListenerId, Node, NodeId, NodeStore,
    NodeValue, SharedNodeStore, Status, StoreResult, TypeCode, ValueChangedListener, ValueType,
};
use xfer_node_store::MemoryNodeStore;

/// A MemoryNodeStore that records the batched calls made against it
pub struct RecordingStore {
    memory: Arc<MemoryNodeStore>,
    reads: AtomicUsize,
    writes: Mutex<Vec<Vec<(NodeId, Value)>>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memory: MemoryNodeStore::shared(),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn memory(&self) -> &MemoryNodeStore {
        &self.memory
    }

    pub fn memory_arc(&self) -> Arc<MemoryNodeStore> {
        self.memory.clone()
    }

    pub fn shared(self: &Arc<Self>) -> SharedNodeStore {
        self.clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_batches(&self) -> Vec<Vec<(NodeId, Value)>> {
        self.writes.lock().unwrap().clone()
    }

    /// Batches that wrote to `id`
    pub fn writes_to(&self, id: &NodeId) -> Vec<Value> {
        self.write_batches()
            .into_iter()
            .flatten()
            .filter(|(node, _)| node == id)
            .map(|(_, value)| value)
            .collect()
    }

    pub fn value_of(&self, id: &NodeId) -> Option<Value> {
        self.memory.node(id).and_then(|n| n.value).map(|v| v.value)
    }
}

#[async_trait]
impl NodeStore for RecordingStore {
    fn root_id(&self) -> NodeId {
        self.memory.root_id()
    }

    fn node(&self, id: &NodeId) -> Option<Node> {
        self.memory.node(id)
    }

    fn node_path(&self, id: &NodeId) -> Option<String> {
        self.memory.node_path(id)
    }

    fn find_node(&self, path: &str) -> Option<Node> {
        self.memory.find_node(path)
    }

    fn children(&self, id: &NodeId) -> Vec<Node> {
        self.memory.children(id)
    }

    fn create_node(&self, spec: CreateNode) -> StoreResult<Node> {
        self.memory.create_node(spec)
    }

    async fn read_values(&self, ids: &[NodeId]) -> Vec<Option<NodeValue>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.memory.read_values(ids).await
    }

    async fn write_values(&self, writes: Vec<(NodeId, Value)>) -> Vec<Status> {
        self.writes.lock().unwrap().push(writes.clone());
        self.memory.write_values(writes).await
    }

    fn on_value_changed(
        &self,
        id: &NodeId,
        listener: ValueChangedListener,
        create_implicit_subscription: bool,
    ) -> ListenerId {
        self.memory
            .on_value_changed(id, listener, create_implicit_subscription)
    }

    fn off_value_changed(&self, id: &NodeId, listener: ListenerId) {
        self.memory.off_value_changed(id, listener)
    }

    fn on_children_changed(&self, id: &NodeId, listener: ChildrenChangedListener) -> ListenerId {
        self.memory.on_children_changed(id, listener)
    }

    fn off_children_changed(&self, id: &NodeId, listener: ListenerId) {
        self.memory.off_children_changed(id, listener)
    }

    fn schedule_deferred(&self, job: DeferredJob) {
        self.memory.schedule_deferred(job)
    }
}

/// Let every runnable task finish
///
/// Tests run with paused time, so the clock only moves once nothing else
/// can make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Create a value node with an initial value
pub async fn value_node(
    store: &RecordingStore,
    parent: &NodeId,
    name: &str,
    type_code: TypeCode,
    value: Option<Value>,
) -> Node {
    let node = store
        .memory()
        .create_value(parent, name, ValueType::scalar(type_code))
        .unwrap();
    if let Some(value) = value {
        store.memory().set_value(&node.id, NodeValue::new(value)).unwrap();
    }
    node
}

/// Create a folder at `path`, including missing parents
pub fn folder(store: &RecordingStore, path: &str) -> Node {
    store.memory().ensure_folder_path(path).unwrap()
}

/// Names of the direct children of a node
pub fn child_names(store: &RecordingStore, id: &NodeId) -> Vec<String> {
    store
        .memory()
        .children(id)
        .into_iter()
        .map(|n| n.name)
        .collect()
}
