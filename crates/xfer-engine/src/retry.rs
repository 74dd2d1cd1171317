//! Batched reads and writes that retry until every item is good

use std::time::Duration;
use tracing::warn;
use xfer_core::{NodeId, NodeStore, NodeValue, Status};

/// How often and how long to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts
    pub delay: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt >= max).unwrap_or(false)
    }
}

fn node_label(store: &dyn NodeStore, id: Option<&NodeId>) -> String {
    id.map(|id| store.node_path(id).unwrap_or_else(|| id.to_string()))
        .unwrap_or_default()
}

/// Read `ids` until every value is present and good
///
/// When the attempt limit is reached the last results are returned as-is.
pub async fn read_values_with_retry(
    store: &dyn NodeStore,
    ids: &[NodeId],
    policy: RetryPolicy,
) -> Vec<Option<NodeValue>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let values = store.read_values(ids).await;

        let failing = values
            .iter()
            .position(|v| !matches!(v, Some(v) if v.status.is_good()));
        let Some(index) = failing else {
            return values;
        };

        let node = node_label(store, ids.get(index));
        let status = match values.get(index) {
            Some(Some(value)) => value.status.text().to_string(),
            _ => "No value".to_string(),
        };

        if policy.exhausted(attempt) {
            warn!(node = %node, status = %status, attempt, "Read failed, giving up");
            return values;
        }
        warn!(node = %node, status = %status, attempt, "Read failed, retrying");
        tokio::time::sleep(policy.delay).await;
    }
}

/// Write `writes` until every status is good
///
/// When the attempt limit is reached the last statuses are returned as-is.
pub async fn write_values_with_retry(
    store: &dyn NodeStore,
    writes: &[(NodeId, serde_json::Value)],
    policy: RetryPolicy,
) -> Vec<Status> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let statuses = store.write_values(writes.to_vec()).await;

        let Some(index) = statuses.iter().position(|s| s.is_bad) else {
            return statuses;
        };

        let node = node_label(store, writes.get(index).map(|(id, _)| id));
        let status = statuses[index].text().to_string();

        if policy.exhausted(attempt) {
            warn!(node = %node, status = %status, attempt, "Write failed, giving up");
            return statuses;
        }
        warn!(node = %node, status = %status, attempt, "Write failed, retrying");
        tokio::time::sleep(policy.delay).await;
    }
}
