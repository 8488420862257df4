//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for every worker spawned by a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Sleep between polling ticks. Bounds worst-case inbound latency and
    /// shutdown latency.
    pub poll_interval_ms: u64,
    /// Wake the worker early when an inbound event or termination request
    /// arrives instead of always sleeping the full interval.
    pub wake_on_push: bool,
    /// Queue depth at which a producer/consumer imbalance warning is logged.
    /// 0 disables the warning.
    pub queue_warn_depth: usize,
    /// Worker threads are named `<prefix>-<id>`.
    pub thread_name_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3,
            wake_on_push: false,
            queue_warn_depth: 10_000,
            thread_name_prefix: "worker".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
