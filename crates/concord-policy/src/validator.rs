//! Capability validators consulted before a value is committed.

use concord_core::{
    CapabilityCheck, CapabilityValidator, PolicyIdentifier, PolicyValue, RejectionReason,
    ValidationContext,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Accepts every value.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl CapabilityValidator for AcceptAll {
    fn can_apply(&self, _ctx: &ValidationContext<'_>) -> CapabilityCheck {
        CapabilityCheck::Accepted
    }
}

/// Rejects policy types the device hardware cannot honour, such as a 2G
/// restriction on a device without a cellular radio.
#[derive(Debug, Default, Clone)]
pub struct HardwareCapabilities {
    unsupported: HashSet<PolicyIdentifier>,
}

impl HardwareCapabilities {
    pub fn new<I, S>(unsupported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PolicyIdentifier>,
    {
        Self {
            unsupported: unsupported.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_supported(&self, identifier: &PolicyIdentifier) -> bool {
        !self.unsupported.contains(identifier)
    }
}

impl CapabilityValidator for HardwareCapabilities {
    fn can_apply(&self, ctx: &ValidationContext<'_>) -> CapabilityCheck {
        if self.is_supported(&ctx.key.identifier) {
            CapabilityCheck::Accepted
        } else {
            CapabilityCheck::Rejected(RejectionReason::HardwareLimitation(format!(
                "{} is not supported on this device",
                ctx.key.identifier
            )))
        }
    }
}

/// For the configured policy types, a string-set value may not share a
/// member with another admin's value under the same key.
///
/// Models per-slice UID inclusion lists: one UID cannot be routed to two
/// network slices at once.
#[derive(Debug, Default, Clone)]
pub struct ExclusiveMembership {
    identifiers: HashSet<PolicyIdentifier>,
}

impl ExclusiveMembership {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PolicyIdentifier>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
        }
    }
}

impl CapabilityValidator for ExclusiveMembership {
    fn can_apply(&self, ctx: &ValidationContext<'_>) -> CapabilityCheck {
        if !self.identifiers.contains(&ctx.key.identifier) {
            return CapabilityCheck::Accepted;
        }
        let Some(proposed) = ctx.value.as_string_set() else {
            return CapabilityCheck::Accepted;
        };
        for other in ctx.existing {
            if let PolicyValue::StringSet(held) = other.value {
                let mut overlap: Vec<&String> = proposed.intersection(held).collect();
                if !overlap.is_empty() {
                    overlap.truncate(3);
                    return CapabilityCheck::Rejected(RejectionReason::ConflictingPolicy(
                        format!(
                            "{:?} already claimed by {} for {}",
                            overlap, other.admin, ctx.key
                        ),
                    ));
                }
            }
        }
        CapabilityCheck::Accepted
    }
}

/// Runs validators in order; the first rejection wins.
#[derive(Default, Clone)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn CapabilityValidator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl CapabilityValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push(&mut self, validator: Arc<dyn CapabilityValidator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl std::fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorChain")
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl CapabilityValidator for ValidatorChain {
    fn can_apply(&self, ctx: &ValidationContext<'_>) -> CapabilityCheck {
        for validator in &self.validators {
            let check = validator.can_apply(ctx);
            if !check.is_accepted() {
                return check;
            }
        }
        CapabilityCheck::Accepted
    }
}
