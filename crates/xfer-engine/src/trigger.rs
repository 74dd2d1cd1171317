//! Trigger types
//!
//! A trigger watches one value node and invokes a callback when the node
//! shows the transition its kind is looking for, or when its interval timer
//! elapses.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use xfer_core::{
    ListenerId, Node, NodeId, NodeValue, SharedNodeStore, TypeCode, ValueChangedEvent, ValueType,
};

use crate::spawn_task;

/// Location hint selecting a toggle trigger
pub const TOGGLE_HINT: &str = "toggle";

/// Location hint selecting a falling edge trigger
pub const FALLING_EDGE_HINT: &str = "fallingedge";

/// Timing settings shared by all triggers of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Period used when an interval node holds no number
    pub default_interval: Duration,
    /// Shorter periods are raised to this value
    pub min_interval: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_millis(500),
            min_interval: Duration::from_millis(50),
        }
    }
}

/// Classification of a trigger node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// Boolean going `false → true`
    RisingEdge,
    /// Boolean going `true → false`
    FallingEdge,
    /// Boolean changing in either direction
    Toggle,
    /// Numeric node holding a timer period in milliseconds
    Interval,
    /// Anything else; never fires
    Unsupported,
}

/// What a trigger does when it is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    /// Only listen for value changes
    Listen,
    /// Listen, and fire at once if the node already reads `true`
    FireIfHigh,
    /// Listen, and arm the timer from the node's value
    ArmTimer,
}

/// What a trigger does when its firing is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    None,
    /// Write `false` back to the node
    ClearPulse,
    /// Arm the timer again with the current period
    RestartTimer,
}

fn is_trigger_numeric(type_code: TypeCode) -> bool {
    matches!(
        type_code,
        TypeCode::Int16
            | TypeCode::UInt16
            | TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::Int64
            | TypeCode::UInt64
            | TypeCode::Single
            | TypeCode::Double
    )
}

impl TriggerKind {
    /// Classify a node from its declared value type and location hint
    pub fn classify(value_type: Option<&ValueType>, location: Option<&str>) -> Self {
        let Some(value_type) = value_type else {
            return TriggerKind::Unsupported;
        };
        if value_type.is_array {
            return TriggerKind::Unsupported;
        }

        let boolean = value_type.type_code == TypeCode::Boolean;
        let hint = location.unwrap_or_default();

        if hint.eq_ignore_ascii_case(TOGGLE_HINT) {
            return if boolean {
                TriggerKind::Toggle
            } else {
                TriggerKind::Unsupported
            };
        }
        if hint.eq_ignore_ascii_case(FALLING_EDGE_HINT) {
            return if boolean {
                TriggerKind::FallingEdge
            } else {
                TriggerKind::Unsupported
            };
        }

        if boolean {
            TriggerKind::RisingEdge
        } else if is_trigger_numeric(value_type.type_code) {
            TriggerKind::Interval
        } else {
            TriggerKind::Unsupported
        }
    }

    /// Classify a node snapshot
    pub fn of(node: &Node) -> Self {
        Self::classify(node.value_type.as_ref(), node.location.as_deref())
    }

    /// Whether a boolean transition fires a trigger of this kind
    pub fn fires_on(&self, old: bool, new: bool) -> bool {
        match self {
            TriggerKind::RisingEdge => !old && new,
            TriggerKind::FallingEdge => old && !new,
            TriggerKind::Toggle => old != new,
            TriggerKind::Interval => false,
            TriggerKind::Unsupported => false,
        }
    }

    pub fn start_action(&self) -> StartAction {
        match self {
            TriggerKind::RisingEdge => StartAction::FireIfHigh,
            TriggerKind::FallingEdge => StartAction::Listen,
            TriggerKind::Toggle => StartAction::Listen,
            TriggerKind::Interval => StartAction::ArmTimer,
            TriggerKind::Unsupported => StartAction::Listen,
        }
    }

    pub fn reset_action(&self) -> ResetAction {
        match self {
            TriggerKind::RisingEdge => ResetAction::ClearPulse,
            TriggerKind::FallingEdge => ResetAction::None,
            TriggerKind::Toggle => ResetAction::None,
            TriggerKind::Interval => ResetAction::RestartTimer,
            TriggerKind::Unsupported => ResetAction::None,
        }
    }

    /// Whether the kind reacts to boolean transitions
    pub fn is_edge(&self) -> bool {
        matches!(
            self,
            TriggerKind::RisingEdge | TriggerKind::FallingEdge | TriggerKind::Toggle
        )
    }
}

/// One-shot timer that can be re-armed
///
/// Arming replaces any outstanding timer, so at most one is pending.
#[derive(Default)]
struct IntervalTimer {
    period: Mutex<Option<Duration>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalTimer {
    fn arm<F>(&self, period: Duration, on_elapsed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = spawn_task("trigger timer", async move {
            tokio::time::sleep(period).await;
            on_elapsed();
        });

        if let Ok(mut slot) = self.period.lock() {
            *slot = Some(period);
        }
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(previous) = std::mem::replace(&mut *slot, handle) {
                previous.abort();
            }
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn period(&self) -> Option<Duration> {
        self.period.lock().ok().and_then(|p| *p)
    }

    fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

/// Callback invoked when a trigger fires
pub type TriggerCallback = Arc<dyn Fn(&Trigger) + Send + Sync + 'static>;

struct TriggerInner {
    node_id: NodeId,
    name: String,
    store: SharedNodeStore,
    settings: TriggerSettings,
    callback: Option<TriggerCallback>,
    timer: IntervalTimer,
    listener: Mutex<Option<ListenerId>>,
    started: AtomicBool,
}

/// Detector over one node of the store
///
/// Cloning yields another handle to the same trigger.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Trigger {
    /// Create a stopped trigger over `node`
    pub fn new(
        store: SharedNodeStore,
        node: &Node,
        callback: Option<TriggerCallback>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                node_id: node.id.clone(),
                name: node.name.clone(),
                store,
                settings,
                callback,
                timer: IntervalTimer::default(),
                listener: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current classification, looked up from the node as it is now
    pub fn kind(&self) -> TriggerKind {
        self.inner
            .store
            .node(&self.inner.node_id)
            .map(|n| TriggerKind::of(&n))
            .unwrap_or(TriggerKind::Unsupported)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Current timer period, once the timer has been armed
    pub fn period(&self) -> Option<Duration> {
        self.inner.timer.period()
    }

    /// Whether a timer is waiting to elapse
    pub fn is_timer_pending(&self) -> bool {
        self.inner.timer.is_pending()
    }

    /// Start listening (and timing, for interval triggers)
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = self.inner.store.on_value_changed(
            &self.inner.node_id,
            Arc::new(move |event: &ValueChangedEvent| {
                if let Some(trigger) = Self::upgrade(&weak) {
                    trigger.handle_value_changed(event);
                }
            }),
            true,
        );
        if let Ok(mut slot) = self.inner.listener.lock() {
            *slot = Some(listener);
        }

        let node = self.inner.store.node(&self.inner.node_id);
        let kind = node
            .as_ref()
            .map(TriggerKind::of)
            .unwrap_or(TriggerKind::Unsupported);
        debug!(trigger = %self.inner.name, ?kind, "Starting trigger");

        match kind.start_action() {
            StartAction::Listen => {}
            StartAction::FireIfHigh => {
                if node.and_then(|n| n.bool_value()) == Some(true) {
                    self.fire();
                }
            }
            StartAction::ArmTimer => {
                let period = node
                    .and_then(|n| n.f64_value())
                    .map(millis)
                    .unwrap_or(self.inner.settings.default_interval);
                self.set_period(period);
            }
        }
    }

    /// Stop listening and clear the timer
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let listener = self.inner.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            self.inner
                .store
                .off_value_changed(&self.inner.node_id, listener);
        }
        self.inner.timer.clear();
        debug!(trigger = %self.inner.name, "Stopped trigger");
    }

    /// Clean up after a firing has been handled
    pub fn reset(&self) {
        match self.kind().reset_action() {
            ResetAction::None => {}
            ResetAction::ClearPulse => {
                let store = self.inner.store.clone();
                let node_id = self.inner.node_id.clone();
                let name = self.inner.name.clone();
                spawn_task("clear trigger pulse", async move {
                    let status = store.write_value(&node_id, json!(false)).await;
                    if status.is_bad {
                        warn!(trigger = %name, status = status.text(), "Failed to clear trigger");
                    }
                });
            }
            ResetAction::RestartTimer => {
                if self.is_started() {
                    let period = self
                        .inner
                        .timer
                        .period()
                        .unwrap_or(self.inner.settings.default_interval);
                    self.arm_timer(period);
                }
            }
        }
    }

    fn upgrade(weak: &Weak<TriggerInner>) -> Option<Trigger> {
        weak.upgrade().map(|inner| Trigger { inner })
    }

    fn handle_value_changed(&self, event: &ValueChangedEvent) {
        let kind = self.kind();
        match kind {
            TriggerKind::RisingEdge | TriggerKind::FallingEdge | TriggerKind::Toggle => {
                if let (Some(old), Some(new)) = (event.old_bool(), event.new_bool()) {
                    if kind.fires_on(old, new) {
                        trace!(trigger = %self.inner.name, old, new, "Edge detected");
                        self.fire();
                    }
                }
            }
            TriggerKind::Interval => {
                match event.new_value.as_ref().and_then(NodeValue::as_f64) {
                    Some(value) => self.set_period(millis(value)),
                    None => {
                        error!(trigger = %self.inner.name, "Interval trigger has no numeric value")
                    }
                }
            }
            TriggerKind::Unsupported => {}
        }
    }

    fn set_period(&self, period: Duration) {
        let min = self.inner.settings.min_interval;
        let period = if period < min {
            warn!(
                trigger = %self.inner.name,
                requested_ms = period.as_millis() as u64,
                min_ms = min.as_millis() as u64,
                "Interval too short, clamping"
            );
            min
        } else {
            period
        };
        self.arm_timer(period);
    }

    fn arm_timer(&self, period: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.timer.arm(period, move || {
            if let Some(trigger) = Self::upgrade(&weak) {
                if trigger.is_started() {
                    trigger.fire();
                }
            }
        });
    }

    fn fire(&self) {
        match &self.inner.callback {
            Some(callback) => {
                debug!(trigger = %self.inner.name, "Trigger fired");
                callback(self);
            }
            None => error!(trigger = %self.inner.name, "Trigger fired without a callback"),
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("node_id", &self.inner.node_id)
            .field("name", &self.inner.name)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Milliseconds from a node value; negative and NaN become zero
fn millis(value: f64) -> Duration {
    Duration::from_millis(value as u64)
}
