//! Transfer discovery
//!
//! The TransferManager polls a root folder for transfer folders, creating
//! a [`Transfer`] for each new one and disposing transfers whose folder has
//! gone. Children-changed notifications on the root dispose removed
//! transfers without waiting for the next poll.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use xfer_core::{ChildrenChangedEvent, ListenerId, Node, NodeId, NodeStore, SharedNodeStore};

use crate::error::{EngineError, EngineResult};
use crate::spawn_task;
use crate::transfer::{create_transfer_node, Transfer};
use crate::trigger::TriggerSettings;

/// Location hint of folders whose children are transfers
pub const GROUP_HINT: &str = "group";

/// Settings of the discovery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Path of the folder scanned for transfers
    pub root_path: String,
    /// Delay between discovery cycles
    pub poll_interval: Duration,
    pub trigger: TriggerSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            root_path: "/Nodes/Transfers".to_string(),
            poll_interval: Duration::from_millis(500),
            trigger: TriggerSettings::default(),
        }
    }
}

/// Transfer folders below `parent`, looking through group folders
fn collect_candidates(store: &dyn NodeStore, parent: &NodeId, out: &mut Vec<Node>) {
    for child in store.children(parent) {
        if !child.kind.is_folder() {
            continue;
        }
        if child.has_location(GROUP_HINT) {
            collect_candidates(store, &child.id, out);
        } else {
            out.push(child);
        }
    }
}

struct ManagerInner {
    store: SharedNodeStore,
    settings: ManagerSettings,
    /// Tracked transfers keyed by folder identity
    transfers: DashMap<NodeId, Transfer>,
    /// Serialises discovery cycles
    poll_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    root_listener: Mutex<Option<(NodeId, ListenerId)>>,
}

/// Owner of every discovered transfer
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    pub fn new(store: SharedNodeStore, settings: ManagerSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                settings,
                transfers: DashMap::new(),
                poll_lock: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                shutdown_tx,
                root_listener: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.inner.transfers.len()
    }

    pub fn transfer_ids(&self) -> Vec<NodeId> {
        self.inner.transfers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get(&self, folder: &NodeId) -> Option<Transfer> {
        self.inner.transfers.get(folder).map(|t| t.clone())
    }

    /// Run one discovery cycle, returning how many transfers were created
    pub async fn poll_once(&self) -> EngineResult<usize> {
        let _guard = self.inner.poll_lock.lock().await;
        let store = self.inner.store.as_ref();

        let root = store
            .find_node(&self.inner.settings.root_path)
            .ok_or_else(|| EngineError::RootNotFound(self.inner.settings.root_path.clone()))?;
        self.attach_root_listener(&root.id);

        let mut candidates = Vec::new();
        collect_candidates(store, &root.id, &mut candidates);
        let wanted: HashSet<&NodeId> = candidates.iter().map(|n| &n.id).collect();

        let stale: Vec<NodeId> = self
            .inner
            .transfers
            .iter()
            .filter(|e| !wanted.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for folder in stale {
            self.dispose_transfer(&folder);
        }

        let mut created = 0;
        for folder in &candidates {
            if self.inner.transfers.contains_key(&folder.id) {
                continue;
            }

            let transfer = match Transfer::create(
                self.inner.store.clone(),
                folder,
                self.inner.settings.trigger,
            )
            .await
            {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!(folder = %folder.name, error = %e, "Failed to create transfer");
                    continue;
                }
            };

            // The folder may have gone while its properties were being created
            if store.node(&folder.id).is_none() {
                transfer.dispose();
                continue;
            }

            info!(transfer = %transfer.path(), active = transfer.is_active(), "Discovered transfer");
            self.inner.transfers.insert(folder.id.clone(), transfer);
            created += 1;
        }

        Ok(created)
    }

    /// Start the discovery loop
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Transfer manager already running");
            return;
        }

        info!(root = %self.inner.settings.root_path, "Starting transfer manager");

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let manager = self.clone();
        let interval = self.inner.settings.poll_interval;

        let handle = spawn_task("transfer discovery", async move {
            let mut root_missing = false;
            loop {
                match manager.poll_once().await {
                    Ok(created) => {
                        root_missing = false;
                        if created > 0 {
                            debug!(created, "Discovery cycle created transfers");
                        }
                    }
                    Err(EngineError::RootNotFound(path)) => {
                        if !root_missing {
                            warn!(root = %path, "Transfers root not found, waiting for it");
                        }
                        root_missing = true;
                    }
                    Err(e) => warn!(error = %e, "Discovery cycle failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }

            manager.inner.running.store(false, Ordering::SeqCst);
            info!("Transfer manager stopped");
        });

        if handle.is_none() {
            self.inner.running.store(false, Ordering::SeqCst);
        }
    }

    /// Stop the discovery loop, keeping the tracked transfers
    pub fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        info!("Stopping transfer manager");
        let _ = self.inner.shutdown_tx.send(());
    }

    /// Stop the loop, dispose every transfer and detach from the root
    pub async fn shutdown(&self) {
        self.stop();
        let _guard = self.inner.poll_lock.lock().await;

        let listener = self.inner.root_listener.lock().ok().and_then(|mut l| l.take());
        if let Some((root, listener)) = listener {
            self.inner.store.off_children_changed(&root, listener);
        }

        for folder in self.transfer_ids() {
            self.dispose_transfer(&folder);
        }
        info!("Transfer manager shut down");
    }

    /// Create a new transfer folder below `parent`, or below the root
    ///
    /// The folder is picked up by the next discovery cycle.
    pub async fn create_transfer(&self, parent: Option<&NodeId>) -> EngineResult<Node> {
        let store = self.inner.store.as_ref();
        let parent = match parent {
            Some(parent) => parent.clone(),
            None => {
                store
                    .find_node(&self.inner.settings.root_path)
                    .ok_or_else(|| {
                        EngineError::RootNotFound(self.inner.settings.root_path.clone())
                    })?
                    .id
            }
        };
        create_transfer_node(store, &parent).await
    }

    fn upgrade(weak: &Weak<ManagerInner>) -> Option<TransferManager> {
        weak.upgrade().map(|inner| TransferManager { inner })
    }

    fn dispose_transfer(&self, folder: &NodeId) {
        if let Some((_, transfer)) = self.inner.transfers.remove(folder) {
            transfer.dispose();
            info!(transfer = %transfer.path(), "Removed transfer");
        }
    }

    fn attach_root_listener(&self, root: &NodeId) {
        let Ok(mut slot) = self.inner.root_listener.lock() else {
            return;
        };
        if let Some((current, _)) = slot.as_ref() {
            if current == root {
                return;
            }
        }
        if let Some((previous, listener)) = slot.take() {
            self.inner.store.off_children_changed(&previous, listener);
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = self.inner.store.on_children_changed(
            root,
            Arc::new(move |event: &ChildrenChangedEvent| {
                if let Some(manager) = Self::upgrade(&weak) {
                    manager.handle_root_children_changed(event);
                }
            }),
        );
        *slot = Some((root.clone(), listener));
    }

    fn handle_root_children_changed(&self, event: &ChildrenChangedEvent) {
        if event.removed.is_empty() {
            return;
        }

        for node in &event.removed {
            self.dispose_transfer(&node.id);
        }

        // Transfers inside a removed group folder
        let orphaned: Vec<NodeId> = self
            .inner
            .transfers
            .iter()
            .filter(|e| self.inner.store.node(e.key()).is_none())
            .map(|e| e.key().clone())
            .collect();
        for folder in orphaned {
            self.dispose_transfer(&folder);
        }
    }
}
