//! Wiring of the store, the transfer manager and the pulse bridges

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use xfer_config::{Configuration, NodeSeed};
use xfer_core::{path_segments, CreateNode, NodeId, NodeStore, NodeValue, SharedNodeStore};
use xfer_engine::{
    write_values_with_retry, ManagerSettings, PulseBridge, RetryPolicy, TransferManager,
    TriggerSettings,
};
use xfer_node_store::MemoryNodeStore;

/// Attempts made when writing seed values
const SEED_WRITE_ATTEMPTS: u32 = 3;

/// A running engine over an in-memory store
pub struct EngineRuntime {
    store: Arc<MemoryNodeStore>,
    manager: TransferManager,
    bridges: Vec<PulseBridge>,
}

impl EngineRuntime {
    /// Build the store and its seeds, the manager and the pulse bridges
    pub async fn build(config: &Configuration) -> Result<Self> {
        let store = MemoryNodeStore::shared();
        let engine = &config.engine;

        store
            .ensure_folder_path(&engine.transfers_root)
            .with_context(|| format!("Failed to create transfers root {}", engine.transfers_root))?;

        let retry = RetryPolicy::new(engine.retry_delay()).with_max_attempts(SEED_WRITE_ATTEMPTS);
        let seeded = seed_nodes(&store, &config.nodes, retry).await?;
        debug!(seeded, "Seeded nodes");

        let shared: SharedNodeStore = store.clone();
        let manager = TransferManager::new(
            shared.clone(),
            ManagerSettings {
                root_path: engine.transfers_root.clone(),
                poll_interval: engine.poll_interval(),
                trigger: TriggerSettings {
                    default_interval: engine.default_trigger_interval(),
                    min_interval: engine.min_trigger_interval(),
                },
            },
        );

        let mut bridges = Vec::with_capacity(config.pulses.len());
        for pulse in &config.pulses {
            match PulseBridge::from_paths(shared.clone(), &pulse.watch, &pulse.trigger) {
                Ok(bridge) => bridges.push(bridge),
                Err(e) => warn!(trigger = %pulse.trigger, error = %e, "Skipping pulse bridge"),
            }
        }

        Ok(Self {
            store,
            manager,
            bridges,
        })
    }

    pub fn store(&self) -> &Arc<MemoryNodeStore> {
        &self.store
    }

    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    /// Start the discovery loop
    pub fn start(&self) {
        self.manager.start();
    }

    /// Detach the pulse bridges and dispose every transfer
    pub async fn shutdown(self) {
        for bridge in &self.bridges {
            bridge.stop();
        }
        self.manager.shutdown().await;
        info!("Transfer engine stopped");
    }
}

/// Create the configured nodes, returning how many were created
///
/// Existing nodes are kept. Initial values of writable nodes go through the
/// store's validated write path; read-only nodes are set directly.
async fn seed_nodes(store: &MemoryNodeStore, seeds: &[NodeSeed], retry: RetryPolicy) -> Result<usize> {
    let mut created = 0;
    let mut writes: Vec<(NodeId, serde_json::Value)> = Vec::new();
    let mut write_paths = Vec::new();

    for seed in seeds {
        let segments = path_segments(&seed.path);
        let Some((name, parents)) = segments.split_last() else {
            bail!("Seed path '{}' is empty", seed.path);
        };

        let node = if seed.kind.is_folder() {
            let existed = store.find_node(&seed.path).is_some();
            let folder = store.ensure_folder_path(&seed.path)?;
            if let Some(location) = &seed.location {
                store.set_location(&folder.id, Some(location))?;
            }
            if !existed {
                created += 1;
            }
            folder
        } else {
            let parent = store.ensure_folder_path(&format!("/{}", parents.join("/")))?;
            match store.child(&parent.id, name) {
                Some(existing) => existing,
                None => {
                    let node = store.create_node(CreateNode {
                        name: name.to_string(),
                        parent: parent.id,
                        kind: seed.kind,
                        value_type: seed.value_type(),
                        location: seed.location.clone(),
                        is_read_only: seed.read_only,
                        history: Default::default(),
                    })?;
                    created += 1;
                    node
                }
            }
        };

        if let Some(value) = &seed.value {
            if node.is_read_only {
                store.set_value(&node.id, NodeValue::new(value.clone()))?;
            } else {
                writes.push((node.id.clone(), value.clone()));
                write_paths.push(seed.path.as_str());
            }
        }
    }

    if !writes.is_empty() {
        let statuses = write_values_with_retry(store, &writes, retry).await;
        if let Some(index) = statuses.iter().position(|s| s.is_bad) {
            return Err(anyhow!(
                "Failed to seed {}: {}",
                write_paths[index],
                statuses[index].text()
            ));
        }
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use xfer_config::load_yaml_string;

    fn config(yaml: &str) -> Configuration {
        let value = load_yaml_string(".", yaml, "configuration.yaml").unwrap();
        Configuration::from_yaml(&value).unwrap()
    }

    const PLANT: &str = r#"
engine:
  poll_interval_ms: 50
  retry_delay_ms: 10
nodes:
  - path: /Nodes/Plant/Level
    type: double
    value: 2.5
  - path: /Nodes/Plant/Serial
    type: string
    read_only: true
    value: "A-17"
  - path: /Nodes/Transfers/Copy/Inputs/Level
    type: double
    value: 2.5
  - path: /Nodes/Transfers/Copy/Outputs/Mirror
    type: double
  - path: /Nodes/Transfers/Copy/Triggers/OnChange
    type: boolean
    value: false
  - path: /Nodes/Transfers/Line
    kind: folder
    location: group
pulses:
  - watch: [/Nodes/Plant/Level]
    trigger: /Nodes/Transfers/Copy/Triggers/OnChange
  - watch: [/Nodes/Plant/Level]
    trigger: /Nodes/Plant/Missing
"#;

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test]
    async fn test_build_seeds_nodes() {
        let runtime = EngineRuntime::build(&config(PLANT)).await.unwrap();
        let store = runtime.store();

        let level = store.find_node("/Nodes/Plant/Level").unwrap();
        assert_eq!(level.value.unwrap().value, json!(2.5));

        let serial = store.find_node("/Nodes/Plant/Serial").unwrap();
        assert!(serial.is_read_only);
        assert_eq!(serial.value.unwrap().value, json!("A-17"));

        let line = store.find_node("/Nodes/Transfers/Line").unwrap();
        assert!(line.has_location("group"));

        // The bridge with a missing trigger is skipped
        assert_eq!(runtime.bridge_count(), 1);
        assert_eq!(runtime.manager().settings().poll_interval, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_bad_seed_value_fails() {
        let bad = config(
            r#"
engine:
  retry_delay_ms: 1
nodes:
  - path: /Nodes/Plant/Count
    type: int32
    value: "many"
"#,
        );
        let err = EngineRuntime::build(&bad).await.err().unwrap();
        assert!(err.to_string().contains("/Nodes/Plant/Count"));
    }

    #[tokio::test]
    async fn test_seeding_keeps_existing_nodes() {
        let store = MemoryNodeStore::new();
        let seeds = config(PLANT).nodes;
        let retry = RetryPolicy::new(Duration::from_millis(1)).with_max_attempts(1);

        let first = seed_nodes(&store, &seeds, retry).await.unwrap();
        let count = store.node_count();
        let second = seed_nodes(&store, &seeds, retry).await.unwrap();

        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(store.node_count(), count);
    }

    #[tokio::test]
    async fn test_pulse_runs_configured_transfer() {
        let runtime = EngineRuntime::build(&config(PLANT)).await.unwrap();
        let store = runtime.store().clone();
        runtime.manager().poll_once().await.unwrap();

        let copy = store.find_node("/Nodes/Transfers/Copy").unwrap();
        let transfer = runtime.manager().get(&copy.id).unwrap();
        store.write_value(transfer.is_active_node(), json!(true)).await;

        let level = store.find_node("/Nodes/Plant/Level").unwrap();
        store.write_value(&level.id, json!(4.0)).await;

        let mirror = store.find_node("/Nodes/Transfers/Copy/Outputs/Mirror").unwrap();
        let copied = wait_for(|| {
            store
                .node(&mirror.id)
                .and_then(|n| n.value)
                .map(|v| v.value == json!(2.5))
                .unwrap_or(false)
        })
        .await;
        assert!(copied);

        runtime.shutdown().await;
        assert_eq!(store.bus().value_listener_count(&level.id), 0);
    }

    #[tokio::test]
    async fn test_start_discovers_transfers() {
        let runtime = EngineRuntime::build(&config(PLANT)).await.unwrap();
        runtime.start();

        let manager = runtime.manager().clone();
        assert!(wait_for(|| manager.transfer_count() == 1).await);
        assert!(manager.is_running());

        runtime.shutdown().await;
        assert_eq!(manager.transfer_count(), 0);
    }
}
