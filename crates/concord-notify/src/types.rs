use concord_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NotifyError, NotifyResult};

// ---------------------------------------------------------------------------
// ListenerId: handle returned by subscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CircuitState: circuit breaker states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

// ---------------------------------------------------------------------------
// ListenerHealth: delivery record kept by each listener's breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerHealth {
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub total_deliveries: u64,
    pub total_failures: u64,
}

impl Default for ListenerHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            circuit_state: CircuitState::Closed,
            last_success: None,
            last_failure: None,
            total_deliveries: 0,
            total_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Consecutive failures before a listener's circuit opens.
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before letting a trial delivery through.
    pub recovery_timeout_seconds: u64,
    /// Milliseconds a key's mailbox may sit empty before its worker exits.
    pub mailbox_idle_millis: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            mailbox_idle_millis: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> NotifyResult<()> {
        if self.failure_threshold == 0 {
            return Err(NotifyError::ConfigurationError(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.mailbox_idle_millis == 0 {
            return Err(NotifyError::ConfigurationError(
                "mailbox_idle_millis must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DispatcherStats
// ---------------------------------------------------------------------------

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Successful sink or listener calls.
    pub delivered: u64,
    /// Calls that returned an error or panicked.
    pub failed: u64,
    /// Listener calls not made because the listener's circuit was open.
    pub skipped: u64,
    /// Updates accepted but not yet processed by a mailbox worker.
    pub pending: u64,
    /// Mailboxes currently running a worker.
    pub mailboxes: usize,
    /// Mailboxes whose worker exited after sitting idle.
    pub retired: u64,
    pub listeners: usize,
}
