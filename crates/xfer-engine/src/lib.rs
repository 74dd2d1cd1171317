//! Transfer Engine
//!
//! This crate watches a hierarchical node store for "transfers": folders
//! that couple a set of trigger nodes to a copy from input nodes to output
//! nodes.
//!
//! # Architecture
//!
//! ```text
//! TRANSFER = TRIGGERS → READ INPUTS → ACKNOWLEDGE → WRITE OUTPUTS
//! ```
//!
//! - **Triggers**: Edge, toggle or interval detectors over one node
//! - **TriggerCollection**: The triggers mounted below one folder
//! - **Transfer**: A folder with `Inputs`, `Outputs`, `Triggers` and `isActive`
//! - **TransferManager**: Discovers and tears down transfers as the tree changes
//!
//! # Key Types
//!
//! - [`TriggerKind`] - Classification of a trigger node
//! - [`Trigger`] - Detector over one node
//! - [`Transfer`] - One transfer and its execute pipeline
//! - [`TransferManager`] - The discovery loop
//! - [`PulseBridge`] - Turns value changes into rising edges

pub mod error;
pub mod manager;
pub mod pulse;
pub mod retry;
pub mod transfer;
pub mod trigger;
pub mod trigger_collection;

pub use error::{EngineError, EngineResult};
pub use manager::{ManagerSettings, TransferManager, GROUP_HINT};
pub use pulse::PulseBridge;
pub use retry::{read_values_with_retry, write_values_with_retry, RetryPolicy};
pub use transfer::{
    create_transfer_node, Transfer, TransferOutcome, INPUTS, IS_ACTIVE, OUTPUTS, TRIGGERS,
};
pub use trigger::{
    ResetAction, StartAction, Trigger, TriggerCallback, TriggerKind, TriggerSettings,
};
pub use trigger_collection::{Acknowledge, CollectionCallback, TriggerCollection};

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn a task on the current runtime, logging instead of panicking without one
pub(crate) fn spawn_task<F>(task: &'static str, future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            error!(task, "No tokio runtime available, task not started");
            None
        }
    }
}
