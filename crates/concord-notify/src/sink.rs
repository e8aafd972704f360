//! Ready-made notification sinks.

use concord_core::{CoreResult, NotificationSink, PolicyKey, PolicyUpdate};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct History {
    updates: VecDeque<PolicyUpdate>,
    /// Updates received since creation or the last `clear`, including any
    /// already evicted.
    received: usize,
}

/// Records the updates it receives, optionally keeping only the most recent
/// ones. Collaborators and tests can block on [`wait_for`](Self::wait_for)
/// instead of sleeping.
#[derive(Default)]
pub struct InMemoryNotificationSink {
    history: Mutex<History>,
    capacity: Option<usize>,
    arrived: Condvar,
}

impl InMemoryNotificationSink {
    /// Keeps every update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the last `capacity` updates; older ones are evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn updates(&self) -> Vec<PolicyUpdate> {
        self.history().updates.iter().cloned().collect()
    }

    pub fn updates_for(&self, key: &PolicyKey) -> Vec<PolicyUpdate> {
        self.history()
            .updates
            .iter()
            .filter(|u| &u.key == key)
            .cloned()
            .collect()
    }

    /// Updates currently held.
    pub fn len(&self) -> usize {
        self.history().updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates received, evicted ones included.
    pub fn received(&self) -> usize {
        self.history().received
    }

    pub fn clear(&self) {
        let mut history = self.history();
        history.updates.clear();
        history.received = 0;
    }

    /// Block until at least `count` updates have been received. Returns
    /// `false` if `timeout` elapsed first.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let (guard, _) = self
            .arrived
            .wait_timeout_while(self.history(), timeout, |h| h.received < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.received >= count
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, update: &PolicyUpdate) -> CoreResult<()> {
        let mut history = self.history();
        if let Some(capacity) = self.capacity {
            while history.updates.len() >= capacity {
                history.updates.pop_front();
            }
        }
        history.updates.push_back(update.clone());
        history.received += 1;
        drop(history);
        self.arrived.notify_all();
        Ok(())
    }
}

/// Emits one structured log line per update.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, update: &PolicyUpdate) -> CoreResult<()> {
        let resolved = update
            .resolved_value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<none>".to_string());
        match update.admin() {
            Some(admin) => tracing::info!(
                event_id = %update.event_id,
                key = %update.key,
                scope = %update.scope,
                admin = %admin,
                outcome = %update.outcome,
                code = update.outcome.code(),
                resolved = %resolved,
                sequence = %update.sequence,
                "policy update"
            ),
            None => tracing::info!(
                event_id = %update.event_id,
                key = %update.key,
                scope = %update.scope,
                outcome = %update.outcome,
                resolved = %resolved,
                sequence = %update.sequence,
                "policy state changed"
            ),
        }
        Ok(())
    }
}
