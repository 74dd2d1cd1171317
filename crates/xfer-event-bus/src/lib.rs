//! Notification fan-out and deferred execution for the node store
//!
//! This crate provides the NotificationBus, which keeps the per-node
//! listeners of a store and delivers value-changed and children-changed
//! notifications to them, and the DeferredQueue, which runs continuations
//! after the current notification has been fully processed.

use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace, warn};
use xfer_core::{
    ChildrenChangedEvent, ChildrenChangedListener, DeferredJob, ListenerId, NodeId, Published,
    StoreEvent, ValueChangedEvent, ValueChangedListener,
};

/// Default channel capacity for the change stream
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Listeners of one notification kind, keyed by node
struct ListenerRegistry<E> {
    listeners: DashMap<NodeId, Vec<(ListenerId, Listener<E>)>>,
}

impl<E> ListenerRegistry<E> {
    fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    fn add(&self, node: &NodeId, id: ListenerId, listener: Listener<E>) {
        self.listeners
            .entry(node.clone())
            .or_default()
            .push((id, listener));
    }

    fn remove(&self, node: &NodeId, id: ListenerId) -> bool {
        let mut removed = false;
        if let Some(mut entries) = self.listeners.get_mut(node) {
            let before = entries.len();
            entries.retain(|(lid, _)| *lid != id);
            removed = entries.len() != before;
        }
        self.listeners.remove_if(node, |_, entries| entries.is_empty());
        removed
    }

    fn clear(&self, node: &NodeId) -> usize {
        self.listeners
            .remove(node)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }

    fn count(&self, node: &NodeId) -> usize {
        self.listeners.get(node).map(|e| e.len()).unwrap_or(0)
    }

    /// Call every listener of `node`
    ///
    /// The listener list is copied before dispatch so listeners may register
    /// or remove listeners themselves. A panicking listener is logged and
    /// does not prevent delivery to the others.
    fn dispatch(&self, node: &NodeId, event: &E, kind: &'static str) -> usize {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .get(node)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(node = %node, kind, "Listener panicked while handling notification");
            }
        }
        listeners.len()
    }
}

/// The notification bus of a node store
///
/// The NotificationBus supports:
/// - Registering value-changed listeners per node
/// - Registering children-changed listeners per node
/// - Synchronous delivery in the order notifications are published
/// - A broadcast stream of every change for passive observers
pub struct NotificationBus {
    value_listeners: ListenerRegistry<ValueChangedEvent>,
    children_listeners: ListenerRegistry<ChildrenChangedEvent>,
    /// Sender for observers of every change
    changes: broadcast::Sender<Published<StoreEvent>>,
    /// Counter for generating unique listener IDs
    next_listener_id: AtomicU64,
}

impl NotificationBus {
    /// Create a new notification bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with the given change stream capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            value_listeners: ListenerRegistry::new(),
            children_listeners: ListenerRegistry::new(),
            changes,
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Generate a new unique listener ID
    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId::from_raw(self.next_listener_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a value change listener for a node
    pub fn on_value_changed(&self, node: &NodeId, listener: ValueChangedListener) -> ListenerId {
        let id = self.next_listener_id();
        trace!(node = %node, listener = id.as_u64(), "Adding value listener");
        self.value_listeners.add(node, id, listener);
        id
    }

    /// Remove a value change listener; returns whether it was registered
    pub fn off_value_changed(&self, node: &NodeId, id: ListenerId) -> bool {
        trace!(node = %node, listener = id.as_u64(), "Removing value listener");
        self.value_listeners.remove(node, id)
    }

    /// Register a children change listener for a node
    pub fn on_children_changed(
        &self,
        node: &NodeId,
        listener: ChildrenChangedListener,
    ) -> ListenerId {
        let id = self.next_listener_id();
        trace!(node = %node, listener = id.as_u64(), "Adding children listener");
        self.children_listeners.add(node, id, listener);
        id
    }

    /// Remove a children change listener; returns whether it was registered
    pub fn off_children_changed(&self, node: &NodeId, id: ListenerId) -> bool {
        trace!(node = %node, listener = id.as_u64(), "Removing children listener");
        self.children_listeners.remove(node, id)
    }

    /// Drop every listener of a node that no longer exists
    pub fn clear_node(&self, node: &NodeId) {
        let dropped = self.value_listeners.clear(node) + self.children_listeners.clear(node);
        if dropped > 0 {
            debug!(node = %node, dropped, "Dropped listeners of removed node");
        }
    }

    /// Number of value listeners registered on a node
    pub fn value_listener_count(&self, node: &NodeId) -> usize {
        self.value_listeners.count(node)
    }

    /// Number of children listeners registered on a node
    pub fn children_listener_count(&self, node: &NodeId) -> usize {
        self.children_listeners.count(node)
    }

    /// Deliver a value change to the node's listeners and the change stream
    pub fn publish_value_changed(&self, event: ValueChangedEvent) {
        let delivered = self
            .value_listeners
            .dispatch(&event.node_id, &event, "value_changed");
        trace!(node = %event.node_id, delivered, "Published value change");
        // Ignore send errors - they just mean no active receivers
        let _ = self
            .changes
            .send(Published::now(StoreEvent::ValueChanged(event)));
    }

    /// Deliver a structural change to the parent's listeners and the change stream
    pub fn publish_children_changed(&self, event: ChildrenChangedEvent) {
        let delivered =
            self.children_listeners
                .dispatch(&event.parent, &event, "children_changed");
        trace!(
            node = %event.parent,
            added = event.added.len(),
            removed = event.removed.len(),
            delivered,
            "Published children change"
        );
        let _ = self
            .changes
            .send(Published::now(StoreEvent::ChildrenChanged(event)));
    }

    /// Subscribe to every change published on this bus
    pub fn subscribe_all(&self) -> broadcast::Receiver<Published<StoreEvent>> {
        self.changes.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue of continuations run outside of notification handlers
///
/// Jobs are executed one at a time, in submission order, by a single task
/// started on the current tokio runtime the first time a job is scheduled.
/// A job scheduled from inside a notification therefore runs only after the
/// notifying code has returned and yielded.
pub struct DeferredQueue {
    tx: mpsc::UnboundedSender<DeferredJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeferredJob>>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue a job
    pub fn schedule(&self, job: DeferredJob) {
        self.ensure_runner();
        if self.tx.send(job).is_err() {
            warn!("Deferred queue closed, dropping job");
        }
    }

    /// Whether the draining task has been started
    pub fn is_running(&self) -> bool {
        self.rx.lock().map(|rx| rx.is_none()).unwrap_or(true)
    }

    fn ensure_runner(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available, deferred jobs stay queued");
            return;
        };

        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(rx) = rx {
            debug!("Starting deferred job runner");
            handle.spawn(Self::run(rx));
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<DeferredJob>) {
        while let Some(job) = rx.recv().await {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Deferred job panicked");
            }
        }
        debug!("Deferred job runner stopped");
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for NotificationBus
pub type SharedNotificationBus = Arc<NotificationBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use xfer_core::NodeValue;

    fn value_event(node: &NodeId, old: bool, new: bool) -> ValueChangedEvent {
        ValueChangedEvent::new(
            node.clone(),
            Some(NodeValue::new(old)),
            Some(NodeValue::new(new)),
        )
    }

    #[test]
    fn test_value_listener_receives_event() {
        let bus = NotificationBus::new();
        let node = NodeId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.on_value_changed(
            &node,
            Arc::new(move |e: &ValueChangedEvent| {
                sink.lock().unwrap().push(e.new_bool());
            }),
        );

        bus.publish_value_changed(value_event(&node, false, true));
        bus.publish_value_changed(value_event(&node, true, false));

        assert_eq!(*seen.lock().unwrap(), vec![Some(true), Some(false)]);
    }

    #[test]
    fn test_no_cross_node_delivery() {
        let bus = NotificationBus::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.on_value_changed(
            &a,
            Arc::new(move |_: &ValueChangedEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish_value_changed(value_event(&b, false, true));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = NotificationBus::new();
        let node = NodeId::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = bus.on_value_changed(
            &node,
            Arc::new(move |_: &ValueChangedEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(bus.value_listener_count(&node), 1);

        assert!(bus.off_value_changed(&node, id));
        assert!(!bus.off_value_changed(&node, id));
        assert_eq!(bus.value_listener_count(&node), 0);

        bus.publish_value_changed(value_event(&node, false, true));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = NotificationBus::new();
        let parent = NodeId::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on_children_changed(
            &parent,
            Arc::new(|_: &ChildrenChangedEvent| panic!("listener failure")),
        );
        let c = count.clone();
        bus.on_children_changed(
            &parent,
            Arc::new(move |_: &ChildrenChangedEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish_children_changed(ChildrenChangedEvent {
            parent: parent.clone(),
            added: Vec::new(),
            removed: Vec::new(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.children_listener_count(&parent), 2);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let bus = Arc::new(NotificationBus::new());
        let node = NodeId::new();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let bus_ref = bus.clone();
        let node_ref = node.clone();
        let slot_ref = slot.clone();
        let id = bus.on_value_changed(
            &node,
            Arc::new(move |_: &ValueChangedEvent| {
                if let Some(id) = slot_ref.lock().unwrap().take() {
                    bus_ref.off_value_changed(&node_ref, id);
                }
            }),
        );
        *slot.lock().unwrap() = Some(id);

        bus.publish_value_changed(value_event(&node, false, true));
        assert_eq!(bus.value_listener_count(&node), 0);
    }

    #[test]
    fn test_listener_id_uniqueness() {
        let bus = NotificationBus::new();
        let id1 = bus.next_listener_id();
        let id2 = bus.next_listener_id();
        let id3 = bus.next_listener_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn test_change_stream() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe_all();
        let node = NodeId::new();

        bus.publish_value_changed(value_event(&node, false, true));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event.node_id(), &node);
        assert!(matches!(received.event, StoreEvent::ValueChanged(_)));
    }

    #[tokio::test]
    async fn test_deferred_jobs_run_in_order_after_yield() {
        let queue = DeferredQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue.schedule(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert!(queue.is_running());
        // Nothing runs before the scheduling task yields
        assert!(order.lock().unwrap().is_empty());

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_deferred_panic_does_not_stop_runner() {
        let queue = DeferredQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        queue.schedule(Box::new(|| panic!("job failure")));
        let r = ran.clone();
        queue.schedule(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
