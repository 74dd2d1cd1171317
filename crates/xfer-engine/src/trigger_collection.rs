//! The set of triggers mounted below one folder

use indexmap::IndexMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, trace};
use xfer_core::{ChildrenChangedEvent, ListenerId, Node, NodeId, SharedNodeStore};

use crate::trigger::{Trigger, TriggerCallback, TriggerSettings};

/// Resets the trigger whose firing is being handled
pub struct Acknowledge(Box<dyn FnOnce() + Send + 'static>);

impl Acknowledge {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// An acknowledgement that does nothing
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn invoke(self) {
        (self.0)()
    }
}

impl fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acknowledge")
    }
}

/// Callback invoked when any member trigger fires
pub type CollectionCallback = Arc<dyn Fn(Acknowledge) + Send + Sync + 'static>;

struct CollectionInner {
    parent: NodeId,
    store: SharedNodeStore,
    settings: TriggerSettings,
    member_callback: TriggerCallback,
    triggers: RwLock<IndexMap<NodeId, Trigger>>,
    active: AtomicBool,
    listener: Mutex<Option<ListenerId>>,
}

/// Triggers for every value child of a parent folder
///
/// Membership follows the parent's children-changed notifications, so it
/// always matches the value children the parent had at the last
/// notification.
#[derive(Clone)]
pub struct TriggerCollection {
    inner: Arc<CollectionInner>,
}

impl TriggerCollection {
    pub fn new(
        store: SharedNodeStore,
        parent: NodeId,
        callback: CollectionCallback,
        settings: TriggerSettings,
    ) -> Self {
        let member_callback: TriggerCallback = Arc::new(move |trigger: &Trigger| {
            let trigger = trigger.clone();
            callback(Acknowledge::new(move || trigger.reset()));
        });

        let collection = Self {
            inner: Arc::new(CollectionInner {
                parent,
                store,
                settings,
                member_callback,
                triggers: RwLock::new(IndexMap::new()),
                active: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        };

        // Listen before enumerating so no child can slip in between
        let weak = Arc::downgrade(&collection.inner);
        let listener = collection.inner.store.on_children_changed(
            &collection.inner.parent,
            Arc::new(move |event: &ChildrenChangedEvent| {
                if let Some(collection) = Self::upgrade(&weak) {
                    collection.handle_children_changed(event);
                }
            }),
        );
        if let Ok(mut slot) = collection.inner.listener.lock() {
            *slot = Some(listener);
        }

        for child in collection.inner.store.children(&collection.inner.parent) {
            collection.add_member(&child);
        }

        collection
    }

    pub fn parent(&self) -> &NodeId {
        &self.inner.parent
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.triggers.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member node identities in the order they were added
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner
            .triggers
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Trigger> {
        self.inner
            .triggers
            .read()
            .ok()
            .and_then(|t| t.get(node_id).cloned())
    }

    /// Start every member trigger
    pub fn activate(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        for trigger in self.members() {
            trigger.start();
        }
    }

    /// Stop every member trigger
    pub fn deactivate(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for trigger in self.members() {
            trigger.stop();
        }
    }

    /// Deactivate, drop all members and stop following the parent
    pub fn dispose(&self) {
        self.deactivate();

        let listener = self.inner.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            self.inner
                .store
                .off_children_changed(&self.inner.parent, listener);
        }

        let removed: Vec<Trigger> = match self.inner.triggers.write() {
            Ok(mut triggers) => triggers.drain(..).map(|(_, t)| t).collect(),
            Err(_) => Vec::new(),
        };
        for trigger in removed {
            trigger.stop();
        }
    }

    fn upgrade(weak: &Weak<CollectionInner>) -> Option<TriggerCollection> {
        weak.upgrade().map(|inner| TriggerCollection { inner })
    }

    fn members(&self) -> Vec<Trigger> {
        self.inner
            .triggers
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn add_member(&self, node: &Node) -> Option<Trigger> {
        if !node.kind.is_value() {
            return None;
        }

        let trigger = Trigger::new(
            self.inner.store.clone(),
            node,
            Some(self.inner.member_callback.clone()),
            self.inner.settings,
        );

        let mut triggers = self.inner.triggers.write().ok()?;
        if triggers.contains_key(&node.id) {
            return None;
        }
        triggers.insert(node.id.clone(), trigger.clone());
        trace!(parent = %self.inner.parent, trigger = %node.name, "Added trigger");
        Some(trigger)
    }

    fn handle_children_changed(&self, event: &ChildrenChangedEvent) {
        for node in &event.removed {
            let removed = self
                .inner
                .triggers
                .write()
                .ok()
                .and_then(|mut t| t.shift_remove(&node.id));
            if let Some(trigger) = removed {
                trigger.stop();
                debug!(parent = %self.inner.parent, trigger = %node.name, "Removed trigger");
            }
        }

        for node in &event.added {
            if let Some(trigger) = self.add_member(node) {
                debug!(parent = %self.inner.parent, trigger = %node.name, "Discovered trigger");
                if self.is_active() {
                    trigger.start();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use xfer_core::{
        ChildrenChangedListener, CreateNode, DeferredJob, NodeStore, NodeValue, Status,
        StoreResult, TypeCode, ValueChangedListener, ValueType,
    };
    use xfer_node_store::MemoryNodeStore;

    struct Fixture {
        store: Arc<MemoryNodeStore>,
        folder: Node,
        fired: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryNodeStore::shared();
            let folder = store.ensure_folder_path("/Nodes/T/Triggers").unwrap();
            Self {
                store,
                folder,
                fired: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn collection(&self, acknowledge: bool) -> TriggerCollection {
            let fired = self.fired.clone();
            let store: SharedNodeStore = self.store.clone();
            TriggerCollection::new(
                store,
                self.folder.id.clone(),
                Arc::new(move |ack: Acknowledge| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    if acknowledge {
                        ack.invoke();
                    }
                }),
                TriggerSettings::default(),
            )
        }

        fn boolean(&self, name: &str) -> Node {
            self.store
                .create_value(&self.folder.id, name, ValueType::boolean())
                .unwrap()
        }

        fn fired(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_membership_follows_children() {
        let fx = Fixture::new();
        let a = fx.boolean("A");
        fx.store.create_folder(&fx.folder.id, "Nested").unwrap();

        let collection = fx.collection(false);
        assert_eq!(collection.node_ids(), vec![a.id.clone()]);

        let b = fx.boolean("B");
        fx.store
            .create_value(&fx.folder.id, "Period", ValueType::scalar(TypeCode::Int32))
            .unwrap();
        assert_eq!(collection.len(), 3);

        fx.store.remove_node(&a.id).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.get(&a.id).is_none());
        assert_eq!(collection.node_ids()[0], b.id);
    }

    /// Adds a value child to the folder while the collection subscribes
    struct ChildOnSubscribe {
        inner: Arc<MemoryNodeStore>,
        folder: NodeId,
        added: AtomicBool,
    }

    #[async_trait::async_trait]
    impl NodeStore for ChildOnSubscribe {
        fn root_id(&self) -> NodeId {
            self.inner.root_id()
        }

        fn node(&self, id: &NodeId) -> Option<Node> {
            self.inner.node(id)
        }

        fn node_path(&self, id: &NodeId) -> Option<String> {
            self.inner.node_path(id)
        }

        fn find_node(&self, path: &str) -> Option<Node> {
            self.inner.find_node(path)
        }

        fn children(&self, id: &NodeId) -> Vec<Node> {
            self.inner.children(id)
        }

        fn create_node(&self, spec: CreateNode) -> StoreResult<Node> {
            self.inner.create_node(spec)
        }

        async fn read_values(&self, ids: &[NodeId]) -> Vec<Option<NodeValue>> {
            self.inner.read_values(ids).await
        }

        async fn write_values(&self, writes: Vec<(NodeId, serde_json::Value)>) -> Vec<Status> {
            self.inner.write_values(writes).await
        }

        fn on_value_changed(
            &self,
            id: &NodeId,
            listener: ValueChangedListener,
            create_implicit_subscription: bool,
        ) -> ListenerId {
            self.inner
                .on_value_changed(id, listener, create_implicit_subscription)
        }

        fn off_value_changed(&self, id: &NodeId, listener: ListenerId) {
            self.inner.off_value_changed(id, listener)
        }

        fn on_children_changed(
            &self,
            id: &NodeId,
            listener: ChildrenChangedListener,
        ) -> ListenerId {
            if id == &self.folder && !self.added.swap(true, Ordering::SeqCst) {
                self.inner
                    .create_value(&self.folder, "Late", ValueType::boolean())
                    .unwrap();
            }
            self.inner.on_children_changed(id, listener)
        }

        fn off_children_changed(&self, id: &NodeId, listener: ListenerId) {
            self.inner.off_children_changed(id, listener)
        }

        fn schedule_deferred(&self, job: DeferredJob) {
            self.inner.schedule_deferred(job)
        }
    }

    #[tokio::test]
    async fn test_child_added_during_subscription_is_a_member() {
        let fx = Fixture::new();
        let a = fx.boolean("A");
        let store: SharedNodeStore = Arc::new(ChildOnSubscribe {
            inner: fx.store.clone(),
            folder: fx.folder.id.clone(),
            added: AtomicBool::new(false),
        });

        let collection = TriggerCollection::new(
            store,
            fx.folder.id.clone(),
            Arc::new(|_ack: Acknowledge| {}),
            TriggerSettings::default(),
        );

        let late = fx.store.find_node("/Nodes/T/Triggers/Late").unwrap();
        assert_eq!(collection.node_ids(), vec![a.id.clone(), late.id]);
    }

    #[tokio::test]
    async fn test_activate_and_deactivate_are_idempotent() {
        let fx = Fixture::new();
        let a = fx.boolean("A");
        fx.store.write_value(&a.id, json!(false)).await;
        let collection = fx.collection(false);

        collection.activate();
        collection.activate();
        assert!(collection.is_active());
        assert_eq!(fx.store.bus().value_listener_count(&a.id), 1);

        fx.store.write_value(&a.id, json!(true)).await;
        assert_eq!(fx.fired(), 1);

        collection.deactivate();
        collection.deactivate();
        assert!(!collection.is_active());
        assert!(!collection.get(&a.id).unwrap().is_started());

        fx.store.write_value(&a.id, json!(false)).await;
        fx.store.write_value(&a.id, json!(true)).await;
        assert_eq!(fx.fired(), 1);
    }

    #[tokio::test]
    async fn test_trigger_added_while_active_is_started() {
        let fx = Fixture::new();
        let collection = fx.collection(false);
        collection.activate();

        let late = fx.boolean("Late");
        assert!(collection.get(&late.id).unwrap().is_started());

        fx.store.write_value(&late.id, json!(false)).await;
        fx.store.write_value(&late.id, json!(true)).await;
        assert_eq!(fx.fired(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_resets_the_firing_trigger() {
        let fx = Fixture::new();
        let a = fx.boolean("A");
        let b = fx.boolean("B");
        fx.store.write_value(&b.id, json!(true)).await;
        fx.store.write_value(&a.id, json!(false)).await;

        let collection = fx.collection(true);
        collection.activate();
        // B was already high
        assert_eq!(fx.fired(), 1);

        fx.store.write_value(&a.id, json!(true)).await;
        assert_eq!(fx.fired(), 2);

        settle().await;
        assert_eq!(fx.store.node(&a.id).unwrap().bool_value(), Some(false));
        assert_eq!(fx.store.node(&b.id).unwrap().bool_value(), Some(false));
    }

    #[tokio::test]
    async fn test_dispose_detaches_everything() {
        let fx = Fixture::new();
        let a = fx.boolean("A");
        let collection = fx.collection(false);
        collection.activate();

        collection.dispose();
        assert!(collection.is_empty());
        assert!(!collection.is_active());
        assert_eq!(fx.store.bus().value_listener_count(&a.id), 0);
        assert_eq!(fx.store.bus().children_listener_count(&fx.folder.id), 0);

        fx.boolean("B");
        assert!(collection.is_empty());
    }

    #[test]
    fn test_acknowledge_invokes_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let ack = Acknowledge::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ack.invoke();
        Acknowledge::noop().invoke();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
