//! Per-listener circuit breaker.
//!
//! A listener that keeps failing stops receiving updates until its recovery
//! timeout has passed, after which one trial delivery decides whether it is
//! back. Closed (healthy), Open (failing), HalfOpen (probing).

use concord_core::Timestamp;
use std::time::{Duration, Instant};

use crate::types::{CircuitState, ListenerHealth};

pub struct CircuitBreaker {
    health: ListenerHealth,
    threshold: u32,
    opened_at: Option<Instant>,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            health: ListenerHealth::default(),
            threshold: threshold.max(1),
            opened_at: None,
            recovery_timeout,
        }
    }

    /// Whether the next delivery should be attempted. Moves an expired Open
    /// circuit to HalfOpen.
    pub fn should_allow(&mut self) -> bool {
        match self.health.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = self
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if expired {
                    self.health.circuit_state = CircuitState::HalfOpen;
                    tracing::info!("listener circuit half-open, probing");
                }
                expired
            }
        }
    }

    pub fn record_success(&mut self) {
        self.health.consecutive_failures = 0;
        self.health.last_success = Some(Timestamp::now());
        self.health.total_deliveries += 1;
        if self.health.circuit_state != CircuitState::Closed {
            self.health.circuit_state = CircuitState::Closed;
            self.opened_at = None;
            tracing::info!("listener circuit closed");
        }
    }

    pub fn record_failure(&mut self) {
        self.health.consecutive_failures += 1;
        self.health.last_failure = Some(Timestamp::now());
        self.health.total_deliveries += 1;
        self.health.total_failures += 1;

        let trip = match self.health.circuit_state {
            CircuitState::Closed => self.health.consecutive_failures >= self.threshold,
            CircuitState::HalfOpen | CircuitState::Open => true,
        };
        if trip {
            if self.health.circuit_state != CircuitState::Open {
                tracing::warn!(
                    consecutive_failures = self.health.consecutive_failures,
                    "listener circuit opened"
                );
            }
            self.health.circuit_state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn health(&self) -> &ListenerHealth {
        &self.health
    }

    pub fn state(&self) -> CircuitState {
        self.health.circuit_state
    }
}
