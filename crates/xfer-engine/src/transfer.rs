//! A single transfer: triggers plus an input to output copy
//!
//! A transfer lives in a folder of the store with this layout:
//!
//! ```text
//! <folder>/
//!   Inputs/     nodes to read, nested folders flattened depth-first
//!   Outputs/    nodes to write, paired with Inputs by position
//!   Triggers/   value nodes; any of them firing runs the copy
//!   isActive    boolean; the triggers only run while it is true
//! ```

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};
use xfer_core::{
    CreateNode, ListenerId, Node, NodeId, NodeKind, NodeStore, SharedNodeStore, StoreError,
    ValueChangedEvent, ValueType,
};

use crate::error::{EngineError, EngineResult};
use crate::spawn_task;
use crate::trigger::TriggerSettings;
use crate::trigger_collection::{Acknowledge, CollectionCallback, TriggerCollection};

pub const INPUTS: &str = "Inputs";
pub const OUTPUTS: &str = "Outputs";
pub const TRIGGERS: &str = "Triggers";
pub const IS_ACTIVE: &str = "isActive";

/// Base name of folders created by [`create_transfer_node`]
pub const NEW_TRANSFER_NAME: &str = "New Transfer";

/// Result of one run of the execute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer was inactive or disposed
    Skipped,
    /// The input at `index` was missing or bad; nothing was written
    Aborted { index: usize },
    /// The batched write was issued
    Completed { written: usize, failed: usize },
}

/// The property nodes of a transfer folder
struct PropertyNodes {
    inputs: NodeId,
    outputs: NodeId,
    triggers: NodeId,
    is_active: NodeId,
}

/// Look up a child by name, creating it from `spec` when missing
fn ensure_child(store: &dyn NodeStore, spec: CreateNode) -> EngineResult<(Node, bool)> {
    if let Some(existing) = store.child(&spec.parent, &spec.name) {
        return Ok((existing, false));
    }
    match store.create_node(spec.clone()) {
        Ok(node) => Ok((node, true)),
        // Created by someone else in the meantime
        Err(StoreError::DuplicateName { .. }) => store
            .child(&spec.parent, &spec.name)
            .map(|n| (n, false))
            .ok_or(EngineError::Store(StoreError::DuplicateName {
                parent: spec.parent,
                name: spec.name,
            })),
        Err(e) => Err(e.into()),
    }
}

fn display_path(store: &dyn NodeStore, node: &Node) -> String {
    store
        .node_path(&node.id)
        .unwrap_or_else(|| node.name.clone())
}

/// Create the property nodes a transfer needs, leaving existing ones alone
async fn ensure_properties(store: &dyn NodeStore, folder: &Node) -> EngineResult<PropertyNodes> {
    let path = display_path(store, folder);
    let invalid = |reason: String| EngineError::InvalidTransfer {
        path: path.clone(),
        reason,
    };

    let mut folders = Vec::with_capacity(3);
    for name in [INPUTS, OUTPUTS, TRIGGERS] {
        let (node, created) = ensure_child(store, CreateNode::folder(folder.id.clone(), name))?;
        if !node.kind.is_folder() {
            return Err(invalid(format!("'{}' must be a folder", name)));
        }
        if created {
            debug!(transfer = %path, property = name, "Created property folder");
        }
        folders.push(node.id);
    }

    let (is_active, created) = ensure_child(
        store,
        CreateNode::value(folder.id.clone(), IS_ACTIVE, ValueType::boolean()),
    )?;
    if is_active.kind != NodeKind::Value || is_active.value_type != Some(ValueType::boolean()) {
        return Err(invalid(format!("'{}' must be a boolean value", IS_ACTIVE)));
    }
    if created {
        let status = store.write_value(&is_active.id, json!(false)).await;
        if status.is_bad {
            warn!(transfer = %path, status = status.text(), "Failed to initialize isActive");
        }
    }

    let mut folders = folders.into_iter();
    match (folders.next(), folders.next(), folders.next()) {
        (Some(inputs), Some(outputs), Some(triggers)) => Ok(PropertyNodes {
            inputs,
            outputs,
            triggers,
            is_active: is_active.id,
        }),
        _ => Err(invalid("property folders missing".to_string())),
    }
}

/// Pick `"New Transfer"`, or `"New Transfer N"` with the smallest free `N >= 2`
pub(crate) fn next_transfer_name(siblings: &[Node]) -> String {
    let taken = |name: &str| siblings.iter().any(|s| s.name == name);
    if !taken(NEW_TRANSFER_NAME) {
        return NEW_TRANSFER_NAME.to_string();
    }
    (2usize..)
        .map(|n| format!("{} {}", NEW_TRANSFER_NAME, n))
        .find(|name| !taken(name))
        .unwrap_or_else(|| NEW_TRANSFER_NAME.to_string())
}

/// Create a new, inactive transfer folder below `parent`
pub async fn create_transfer_node(store: &dyn NodeStore, parent: &NodeId) -> EngineResult<Node> {
    let name = next_transfer_name(&store.children(parent));
    let folder = store.create_node(CreateNode::folder(parent.clone(), name))?;
    ensure_properties(store, &folder).await?;
    info!(transfer = %display_path(store, &folder), "Created new transfer");
    Ok(folder)
}

/// Leaves below `id`, descending into folders depth-first
fn flatten(store: &dyn NodeStore, id: &NodeId, out: &mut Vec<Node>) {
    for child in store.children(id) {
        if child.kind.is_folder() {
            flatten(store, &child.id, out);
        } else {
            out.push(child);
        }
    }
}

struct TransferInner {
    node_id: NodeId,
    name: String,
    path: String,
    store: SharedNodeStore,
    properties: PropertyNodes,
    triggers: TriggerCollection,
    active: AtomicBool,
    disposed: AtomicBool,
    is_active_listener: Mutex<Option<ListenerId>>,
}

/// A running transfer
///
/// Cloning yields another handle to the same transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl Transfer {
    /// Set up a transfer over `folder`
    ///
    /// Missing property nodes are created first. The transfer activates at
    /// once if `isActive` already reads `true`.
    pub async fn create(
        store: SharedNodeStore,
        folder: &Node,
        settings: TriggerSettings,
    ) -> EngineResult<Transfer> {
        let path = display_path(store.as_ref(), folder);
        if !folder.kind.is_folder() {
            return Err(EngineError::InvalidTransfer {
                path,
                reason: "a transfer must be a folder".to_string(),
            });
        }

        let properties = ensure_properties(store.as_ref(), folder).await?;

        let inner = Arc::new_cyclic(|weak: &Weak<TransferInner>| {
            let weak = weak.clone();
            let callback: CollectionCallback = Arc::new(move |ack: Acknowledge| {
                if let Some(transfer) = Self::upgrade(&weak) {
                    transfer.schedule_execution(ack);
                }
            });
            let triggers =
                TriggerCollection::new(store.clone(), properties.triggers.clone(), callback, settings);

            TransferInner {
                node_id: folder.id.clone(),
                name: folder.name.clone(),
                path,
                store,
                properties,
                triggers,
                active: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                is_active_listener: Mutex::new(None),
            }
        });
        let transfer = Transfer { inner };

        let weak = Arc::downgrade(&transfer.inner);
        let listener = transfer.inner.store.on_value_changed(
            &transfer.inner.properties.is_active,
            Arc::new(move |event: &ValueChangedEvent| {
                if let Some(transfer) = Self::upgrade(&weak) {
                    transfer.handle_is_active_changed(event);
                }
            }),
            true,
        );
        if let Ok(mut slot) = transfer.inner.is_active_listener.lock() {
            *slot = Some(listener);
        }

        let initially_active = transfer
            .inner
            .store
            .node(&transfer.inner.properties.is_active)
            .and_then(|n| n.bool_value())
            == Some(true);
        if initially_active {
            transfer.activate();
        }

        debug!(transfer = %transfer.inner.path, triggers = transfer.trigger_count(), "Transfer created");
        Ok(transfer)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Identity of the `isActive` node
    pub fn is_active_node(&self) -> &NodeId {
        &self.inner.properties.is_active
    }

    pub fn triggers(&self) -> &TriggerCollection {
        &self.inner.triggers
    }

    pub fn trigger_count(&self) -> usize {
        self.inner.triggers.len()
    }

    /// Current input leaves in pairing order
    pub fn inputs(&self) -> Vec<Node> {
        let mut out = Vec::new();
        flatten(self.inner.store.as_ref(), &self.inner.properties.inputs, &mut out);
        out
    }

    /// Current output leaves in pairing order
    pub fn outputs(&self) -> Vec<Node> {
        let mut out = Vec::new();
        flatten(self.inner.store.as_ref(), &self.inner.properties.outputs, &mut out);
        out
    }

    /// Start the triggers
    pub fn activate(&self) {
        if self.is_disposed() {
            return;
        }
        if !self.inner.active.swap(true, Ordering::SeqCst) {
            self.inner.triggers.activate();
            info!(transfer = %self.inner.path, "Transfer activated");
        }
    }

    /// Stop the triggers
    pub fn deactivate(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.inner.triggers.deactivate();
            info!(transfer = %self.inner.path, "Transfer deactivated");
        }
    }

    /// Tear the transfer down; later firings and executions are no-ops
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deactivate();

        let listener = self
            .inner
            .is_active_listener
            .lock()
            .ok()
            .and_then(|mut l| l.take());
        if let Some(listener) = listener {
            self.inner
                .store
                .off_value_changed(&self.inner.properties.is_active, listener);
        }
        self.inner.triggers.dispose();
        info!(transfer = %self.inner.path, "Transfer disposed");
    }

    /// Read the inputs, acknowledge the trigger, then write the outputs
    pub async fn execute(&self, acknowledge: Acknowledge) -> TransferOutcome {
        if self.is_disposed() || !self.is_active() {
            debug!(transfer = %self.inner.path, "Transfer not active, skipping execution");
            return TransferOutcome::Skipped;
        }

        let store = self.inner.store.as_ref();
        let inputs = self.inputs();
        let outputs = self.outputs();
        if inputs.len() != outputs.len() {
            warn!(
                transfer = %self.inner.path,
                inputs = inputs.len(),
                outputs = outputs.len(),
                "Input and output counts differ"
            );
        }

        let input_ids: Vec<NodeId> = inputs.iter().map(|n| n.id.clone()).collect();
        let values = store.read_values(&input_ids).await;
        acknowledge.invoke();

        let mut writes = Vec::with_capacity(outputs.len());
        for (index, ((input, output), value)) in
            inputs.iter().zip(outputs.iter()).zip(values).enumerate()
        {
            match value {
                Some(value) if value.status.is_good() => {
                    writes.push((output.id.clone(), value.value));
                }
                Some(value) => {
                    error!(
                        transfer = %self.inner.path,
                        input = %display_path(store, input),
                        status = value.status.text(),
                        "Failed to read input, aborting transfer"
                    );
                    return TransferOutcome::Aborted { index };
                }
                None => {
                    error!(
                        transfer = %self.inner.path,
                        input = %display_path(store, input),
                        "Input has no value, aborting transfer"
                    );
                    return TransferOutcome::Aborted { index };
                }
            }
        }

        if writes.is_empty() {
            debug!(transfer = %self.inner.path, "Nothing to write");
            return TransferOutcome::Completed {
                written: 0,
                failed: 0,
            };
        }

        let statuses = store.write_values(writes.clone()).await;
        let failed = statuses.iter().filter(|s| s.is_bad).count();
        if failed > 0 {
            error!(
                transfer = %self.inner.path,
                failed,
                "One or more errors occurred during writing the values"
            );
        }
        for ((node_id, value), status) in writes.iter().zip(statuses.iter()) {
            if status.is_bad {
                let node = store
                    .node_path(node_id)
                    .unwrap_or_else(|| node_id.to_string());
                error!(
                    transfer = %self.inner.path,
                    node = %node,
                    value = %value,
                    status = status.text(),
                    "Failed to write output"
                );
            }
        }

        let written = writes.len() - failed;
        if failed == 0 {
            info!(transfer = %self.inner.path, written, "Transfer completed");
        }
        TransferOutcome::Completed { written, failed }
    }

    fn upgrade(weak: &Weak<TransferInner>) -> Option<Transfer> {
        weak.upgrade().map(|inner| Transfer { inner })
    }

    fn handle_is_active_changed(&self, event: &ValueChangedEvent) {
        if event.new_bool() == Some(true) {
            self.activate();
        } else {
            self.deactivate();
        }
    }

    /// Run the pipeline once the current notification has been handled
    fn schedule_execution(&self, acknowledge: Acknowledge) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.store.schedule_deferred(Box::new(move || {
            if let Some(transfer) = Self::upgrade(&weak) {
                spawn_task("transfer execution", async move {
                    transfer.execute(acknowledge).await;
                });
            }
        }));
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("path", &self.inner.path)
            .field("active", &self.is_active())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str) -> Node {
        Node {
            id: NodeId::new(),
            name: name.to_string(),
            parent: None,
            kind: NodeKind::Folder,
            value_type: None,
            location: None,
            is_read_only: false,
            history: Default::default(),
            value: None,
        }
    }

    #[test]
    fn test_next_transfer_name() {
        assert_eq!(next_transfer_name(&[]), "New Transfer");
        assert_eq!(
            next_transfer_name(&[folder("New Transfer")]),
            "New Transfer 2"
        );
        assert_eq!(
            next_transfer_name(&[folder("New Transfer"), folder("New Transfer 2")]),
            "New Transfer 3"
        );
        assert_eq!(
            next_transfer_name(&[folder("New Transfer"), folder("New Transfer 3")]),
            "New Transfer 2"
        );
        assert_eq!(next_transfer_name(&[folder("New Transfer 2")]), "New Transfer");
    }

    #[test]
    fn test_outcome_equality() {
        assert_ne!(
            TransferOutcome::Aborted { index: 0 },
            TransferOutcome::Skipped
        );
        assert_eq!(
            TransferOutcome::Completed {
                written: 1,
                failed: 0
            },
            TransferOutcome::Completed {
                written: 1,
                failed: 0
            }
        );
    }
}
