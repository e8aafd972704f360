use concord_core::{
    AdminIdentity, PolicyIdentifier, PolicyKey, PolicyScope, PolicyScopeKind, PolicyUpdateResult,
    PolicyValue, RejectionReason, SequenceNumber, Timestamp, UserId, ValueKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PolicyError, PolicyResult};

// ---------------------------------------------------------------------------
// PolicyEntry: one admin's recorded value for a key
// ---------------------------------------------------------------------------

/// One admin's value for a key. Replaced wholesale on every set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub admin: AdminIdentity,
    pub value: PolicyValue,
    pub importance: i32,
    pub set_at: SequenceNumber,
    pub set_at_time: Timestamp,
}

// ---------------------------------------------------------------------------
// MechanismKind: how per-admin values reduce to one resolved value
// ---------------------------------------------------------------------------

/// Closed set of resolution strategies. Bound to a policy type at
/// registration and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mechanism", rename_all = "snake_case")]
pub enum MechanismKind {
    /// Highest position in `least_to_most` wins.
    MostRestrictive { least_to_most: Vec<PolicyValue> },
    /// Latest set wins.
    MostRecent,
    /// Highest importance wins, then latest set.
    TopmostAuthority,
    /// Union of every admin's string set.
    StringSetUnion,
}

impl MechanismKind {
    /// `false < true`: `true` is the restrictive value.
    pub fn true_more_restrictive() -> Self {
        MechanismKind::MostRestrictive {
            least_to_most: vec![PolicyValue::Boolean(false), PolicyValue::Boolean(true)],
        }
    }

    /// `true < false`: `false` is the restrictive value.
    pub fn false_more_restrictive() -> Self {
        MechanismKind::MostRestrictive {
            least_to_most: vec![PolicyValue::Boolean(true), PolicyValue::Boolean(false)],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MechanismKind::MostRestrictive { .. } => "most_restrictive",
            MechanismKind::MostRecent => "most_recent",
            MechanismKind::TopmostAuthority => "topmost_authority",
            MechanismKind::StringSetUnion => "string_set_union",
        }
    }
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismKind::MostRestrictive { least_to_most } => {
                write!(f, "most_restrictive(")?;
                for (i, v) in least_to_most.iter().enumerate() {
                    if i > 0 {
                        write!(f, " < ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyDefinition: registry entry for a policy type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub identifier: PolicyIdentifier,
    #[serde(flatten)]
    pub mechanism: MechanismKind,
    #[serde(default)]
    pub scope: PolicyScopeKind,
}

impl PolicyDefinition {
    pub fn new(
        identifier: impl Into<PolicyIdentifier>,
        mechanism: MechanismKind,
        scope: PolicyScopeKind,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            mechanism,
            scope,
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyState: point-in-time snapshot of one key
// ---------------------------------------------------------------------------

/// Snapshot of everything the engine knows about one key at one target.
///
/// Per-user policies keep a separate state for every user that has an
/// admin holding an entry; global policies have a single state.
/// Snapshots are immutable once published: a mutation builds a new one.
/// `resolved_value` always equals the mechanism applied to `entries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    pub key: PolicyKey,
    pub scope: PolicyScopeKind,
    /// Where the resolved value is enforced.
    pub target: PolicyScope,
    #[serde(with = "entry_list")]
    pub entries: BTreeMap<AdminIdentity, PolicyEntry>,
    pub resolved_value: Option<PolicyValue>,
    pub mechanism: MechanismKind,
    /// Kind established by the first setter.
    pub value_kind: Option<ValueKind>,
}

impl PolicyState {
    pub fn entry(&self, admin: &AdminIdentity) -> Option<&PolicyEntry> {
        self.entries.get(admin)
    }

    pub fn admins(&self) -> impl Iterator<Item = &AdminIdentity> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializes the entry map as a list; admin identities are not string keys.
mod entry_list {
    use super::PolicyEntry;
    use concord_core::AdminIdentity;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        entries: &BTreeMap<AdminIdentity, PolicyEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&PolicyEntry> = entries.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<AdminIdentity, PolicyEntry>, D::Error> {
        let list = Vec::<PolicyEntry>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.admin.clone(), e)).collect())
    }
}

// ---------------------------------------------------------------------------
// DevicePolicyState: snapshot of every key with at least one entry
// ---------------------------------------------------------------------------

/// Every non-empty policy, ordered by key and then target. Each state is
/// individually consistent; the collection is not a cross-key transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePolicyState {
    policies: Vec<PolicyState>,
}

impl DevicePolicyState {
    pub fn new(mut policies: Vec<PolicyState>) -> Self {
        policies.sort_by(|a, b| (&a.key, a.target).cmp(&(&b.key, b.target)));
        Self { policies }
    }

    pub fn get(&self, key: &PolicyKey, target: PolicyScope) -> Option<&PolicyState> {
        self.policies
            .binary_search_by(|s| (&s.key, s.target).cmp(&(key, target)))
            .ok()
            .map(|i| &self.policies[i])
    }

    /// Policies in force for `user`: global ones plus that user's own.
    pub fn policies_for_user(&self, user: UserId) -> impl Iterator<Item = &PolicyState> {
        self.policies.iter().filter(move |s| s.target.applies_to(user))
    }

    pub fn for_scope(&self, scope: PolicyScopeKind) -> impl Iterator<Item = &PolicyState> {
        self.policies.iter().filter(move |s| s.scope == scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyState> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Outcome of `set_policy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResult {
    /// The value was stored.
    pub accepted: bool,
    /// The resolved value differs from the one before this call.
    pub resolved_changed: bool,
    /// What the setter is told: `PolicySet`, a conflict if another admin's
    /// value wins, or the validator's failure code.
    pub outcome: PolicyUpdateResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionReason>,
    pub resolved_value: Option<PolicyValue>,
}

impl SetResult {
    pub(crate) fn rejected(reason: RejectionReason, resolved_value: Option<PolicyValue>) -> Self {
        Self {
            accepted: false,
            resolved_changed: false,
            outcome: reason.outcome(),
            rejection: Some(reason),
            resolved_value,
        }
    }

    /// Convert a validator rejection into `PolicyError::BusinessRuleRejected`.
    pub fn into_result(self) -> PolicyResult<SetResult> {
        match self.rejection {
            Some(reason) if !self.accepted => Err(PolicyError::BusinessRuleRejected(reason)),
            _ => Ok(self),
        }
    }
}

/// Outcome of `clear_policy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResult {
    /// The admin held an entry and it was removed.
    pub removed: bool,
    pub resolved_changed: bool,
    pub resolved_value: Option<PolicyValue>,
}

impl From<ClearResult> for SetResult {
    fn from(cleared: ClearResult) -> Self {
        Self {
            accepted: true,
            resolved_changed: cleared.resolved_changed,
            outcome: PolicyUpdateResult::PolicyCleared,
            rejection: None,
            resolved_value: cleared.resolved_value,
        }
    }
}
