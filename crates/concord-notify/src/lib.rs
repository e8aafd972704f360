//! Concord Notification Channel
//!
//! Delivers policy update notifications produced by the policy engine to
//! the admins holding entries and to local listeners, off the engine's
//! call path.
//!
//! Key features:
//! - One mailbox and worker thread per policy key, spawned lazily
//! - Same-key updates delivered in the order the engine serialized them
//! - Per-listener circuit breaker; panicking listeners are contained
//! - Collaborator-side waiting with `wait_idle` and `InMemoryNotificationSink::wait_for`

pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod sink;
pub mod types;

// Re-export primary types
pub use circuit_breaker::CircuitBreaker;
pub use dispatcher::NotificationDispatcher;
pub use error::{NotifyError, NotifyResult};
pub use sink::{InMemoryNotificationSink, TracingNotificationSink};
pub use types::{CircuitState, DispatcherConfig, DispatcherStats, ListenerHealth, ListenerId};
