//! Heartbeat and dispatch cadence.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between heartbeat messages.
    #[validate(range(
        min = 1,
        max = 86_400,
        message = "Heartbeat interval must be between 1 second and 1 day"
    ))]
    pub heartbeat_interval_secs: u64,

    /// Milliseconds between `dispatch_once` calls.
    #[validate(range(
        min = 1,
        max = 60_000,
        message = "Dispatch interval must be between 1 and 60000 ms"
    ))]
    pub dispatch_interval_ms: u64,

    /// Heartbeats are skipped while this many messages are still unsent.
    #[validate(range(min = 1, message = "Backlog limit must be at least 1"))]
    pub max_backlog: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            dispatch_interval_ms: 100,
            max_backlog: 100,
        }
    }
}
