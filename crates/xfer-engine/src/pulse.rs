//! Value-change pulse bridge
//!
//! A PulseBridge watches a set of value nodes and, when any of them
//! changes, writes `false` then `true` to a boolean trigger node. This lets
//! a rising edge trigger run a transfer whenever a source value changes.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};
use xfer_core::{
    ListenerId, NodeId, NodeStore, SharedNodeStore, TypeCode, ValueChangedEvent,
};

use crate::error::{EngineError, EngineResult};
use crate::spawn_task;

struct PulseInner {
    store: SharedNodeStore,
    trigger: NodeId,
    trigger_path: String,
    watched: Mutex<Vec<(NodeId, ListenerId)>>,
    /// A pulse has been scheduled but not started
    pending: AtomicBool,
    stopped: AtomicBool,
    pulses: AtomicU64,
}

/// Pulses a trigger node whenever watched nodes change
pub struct PulseBridge {
    inner: Arc<PulseInner>,
}

impl PulseBridge {
    /// Watch `watch` and pulse `trigger`
    pub fn new(store: SharedNodeStore, watch: &[NodeId], trigger: NodeId) -> EngineResult<Self> {
        let node = store
            .node(&trigger)
            .ok_or_else(|| xfer_core::StoreError::NodeNotFound(trigger.clone()))?;
        let trigger_path = store
            .node_path(&trigger)
            .unwrap_or_else(|| node.name.clone());

        let boolean = node
            .value_type
            .map(|t| t.type_code == TypeCode::Boolean && !t.is_array)
            .unwrap_or(false);
        if !node.kind.is_value() || !boolean {
            return Err(EngineError::InvalidTrigger {
                path: trigger_path,
                reason: "pulse target must be a boolean value".to_string(),
            });
        }

        let bridge = Self {
            inner: Arc::new(PulseInner {
                store,
                trigger,
                trigger_path,
                watched: Mutex::new(Vec::new()),
                pending: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                pulses: AtomicU64::new(0),
            }),
        };

        for id in watch {
            let weak = Arc::downgrade(&bridge.inner);
            let listener = bridge.inner.store.on_value_changed(
                id,
                Arc::new(move |event: &ValueChangedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        Self::handle_value_changed(&inner, event);
                    }
                }),
                true,
            );
            if let Ok(mut watched) = bridge.inner.watched.lock() {
                watched.push((id.clone(), listener));
            }
        }

        debug!(trigger = %bridge.inner.trigger_path, watched = watch.len(), "Pulse bridge started");
        Ok(bridge)
    }

    /// Resolve paths, then watch and pulse like [`PulseBridge::new`]
    pub fn from_paths(store: SharedNodeStore, watch: &[String], trigger: &str) -> EngineResult<Self> {
        let trigger = store.find_node_required(trigger)?.id;
        let watch = watch
            .iter()
            .map(|path| store.find_node_required(path).map(|n| n.id))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(store, &watch, trigger)
    }

    pub fn trigger(&self) -> &NodeId {
        &self.inner.trigger
    }

    pub fn watch_count(&self) -> usize {
        self.inner.watched.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Number of pulses written so far
    pub fn pulse_count(&self) -> u64 {
        self.inner.pulses.load(Ordering::SeqCst)
    }

    /// Detach from every watched node
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let watched = match self.inner.watched.lock() {
            Ok(mut watched) => std::mem::take(&mut *watched),
            Err(_) => Vec::new(),
        };
        for (id, listener) in watched {
            self.inner.store.off_value_changed(&id, listener);
        }
    }

    fn handle_value_changed(inner: &Arc<PulseInner>, event: &ValueChangedEvent) {
        let good = event
            .new_value
            .as_ref()
            .map(|v| v.status.is_good())
            .unwrap_or(false);
        if !event.is_value_changed || !good || inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        // Coalesce with a pulse that has not run yet
        if inner.pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<PulseInner> = Arc::downgrade(inner);
        inner.store.schedule_deferred(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                spawn_task("trigger pulse", Self::pulse(inner));
            }
        }));
    }

    async fn pulse(inner: Arc<PulseInner>) {
        inner.pending.store(false, Ordering::SeqCst);
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        for value in [false, true] {
            let status = inner.store.write_value(&inner.trigger, json!(value)).await;
            if status.is_bad {
                warn!(trigger = %inner.trigger_path, status = status.text(), "Failed to pulse trigger");
                return;
            }
        }
        inner.pulses.fetch_add(1, Ordering::SeqCst);
        debug!(trigger = %inner.trigger_path, "Pulsed trigger");
    }
}

impl Drop for PulseBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
