use crate::error::CoreResult;
use crate::types::{AdminIdentity, PolicyKey, PolicyUpdate, PolicyValue, RejectionReason};

// ---------------------------------------------------------------------------
// CapabilityValidator: hardware, permission and business-rule checks
//
// Invoked before a value is committed. The engine treats the validator as
// opaque: it only distinguishes accepted from rejected.
// ---------------------------------------------------------------------------

/// Another admin's current value for the key being validated.
#[derive(Debug, Clone, Copy)]
pub struct ExistingValue<'a> {
    pub admin: &'a AdminIdentity,
    pub value: &'a PolicyValue,
}

/// Everything a validator may inspect for one proposed set.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub key: &'a PolicyKey,
    pub admin: &'a AdminIdentity,
    pub value: &'a PolicyValue,
    /// Entries held by admins other than `admin`.
    pub existing: &'a [ExistingValue<'a>],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityCheck {
    Accepted,
    Rejected(RejectionReason),
}

impl CapabilityCheck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CapabilityCheck::Accepted)
    }
}

pub trait CapabilityValidator: Send + Sync {
    fn can_apply(&self, ctx: &ValidationContext<'_>) -> CapabilityCheck;
}

// ---------------------------------------------------------------------------
// NotificationSink: outbound policy update delivery
//
// The engine calls `notify` while holding the per-key lock, so
// implementations must only enqueue.
// ---------------------------------------------------------------------------

pub trait NotificationSink: Send + Sync {
    fn notify(&self, update: &PolicyUpdate) -> CoreResult<()>;
}

/// Sink that drops every update. Used when no notifier is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl NotificationSink for DiscardSink {
    fn notify(&self, _update: &PolicyUpdate) -> CoreResult<()> {
        Ok(())
    }
}
