//! Concord Policy Engine
//!
//! Reconciles device policies set by several administrators into a single
//! resolved value per policy key.
//!
//! Key features:
//! - Per-policy-type resolution mechanisms (most restrictive, most recent,
//!   topmost authority, string-set union), fixed at startup
//! - Per-key serialization with copy-on-write snapshots for readers
//! - Engine-wide sequence numbers for recency, never wall-clock time
//! - Capability validators that can reject a value before it is stored
//! - Outcome notifications to every affected admin and to local listeners

pub mod catalog;
pub mod engine;
pub mod error;
pub mod mechanism;
pub mod registry;
pub mod types;
pub mod validator;

// Re-export primary types for convenience
pub use engine::PolicyEngine;
pub use error::{PolicyError, PolicyErrorKind, PolicyResult};
pub use registry::{MechanismRegistry, MechanismRegistryBuilder};
pub use types::{
    ClearResult, DevicePolicyState, MechanismKind, PolicyDefinition, PolicyEntry, PolicyState,
    SetResult,
};
pub use validator::{AcceptAll, ExclusiveMembership, HardwareCapabilities, ValidatorChain};
