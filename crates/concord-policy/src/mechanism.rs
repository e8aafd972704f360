//! Resolution mechanisms: reduce every admin's entry for a key to the one
//! value the rest of the system observes.
//!
//! All mechanisms are pure functions of the entry set. Recency is the
//! engine-assigned sequence number, so results never depend on map
//! iteration order.

use concord_core::{PolicyValue, ValueKind};
use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::types::{MechanismKind, PolicyEntry};

impl MechanismKind {
    /// Compute the resolved value. `None` iff there are no entries.
    pub fn resolve<'a, I>(&self, entries: I) -> Option<PolicyValue>
    where
        I: IntoIterator<Item = &'a PolicyEntry>,
    {
        let entries = entries.into_iter();
        match self {
            MechanismKind::MostRestrictive { least_to_most } => entries
                .max_by_key(|e| (restriction_rank(least_to_most, &e.value), Reverse(e.set_at)))
                .map(|e| e.value.clone()),
            MechanismKind::MostRecent => entries.max_by_key(|e| e.set_at).map(|e| e.value.clone()),
            MechanismKind::TopmostAuthority => entries
                .max_by_key(|e| (e.importance, e.set_at))
                .map(|e| e.value.clone()),
            MechanismKind::StringSetUnion => {
                let mut seen = false;
                let mut union = BTreeSet::new();
                for entry in entries {
                    seen = true;
                    if let PolicyValue::StringSet(set) = &entry.value {
                        union.extend(set.iter().cloned());
                    }
                }
                seen.then_some(PolicyValue::StringSet(union))
            }
        }
    }

    /// Whether an admin that set `value` sees it enforced by `resolved`.
    pub fn honours(&self, resolved: &PolicyValue, value: &PolicyValue) -> bool {
        match self {
            MechanismKind::StringSetUnion => match (resolved, value) {
                (PolicyValue::StringSet(all), PolicyValue::StringSet(mine)) => mine.is_subset(all),
                _ => false,
            },
            _ => resolved == value,
        }
    }

    /// The only value kind this mechanism can resolve, if it is restricted.
    pub fn required_kind(&self) -> Option<ValueKind> {
        match self {
            MechanismKind::MostRestrictive { least_to_most } => {
                least_to_most.first().map(PolicyValue::kind)
            }
            MechanismKind::StringSetUnion => Some(ValueKind::StringSet),
            MechanismKind::MostRecent | MechanismKind::TopmostAuthority => None,
        }
    }

    pub fn accepts(&self, kind: ValueKind) -> bool {
        kind != ValueKind::Unset && self.required_kind().map_or(true, |k| k == kind)
    }

    /// Reject orderings that could never resolve consistently.
    pub fn validate(&self) -> Result<(), String> {
        if let MechanismKind::MostRestrictive { least_to_most } = self {
            let first = least_to_most
                .first()
                .ok_or_else(|| "most_restrictive ordering must not be empty".to_string())?;
            if first.is_unset() {
                return Err("most_restrictive ordering must not contain unset".into());
            }
            if least_to_most.iter().any(|v| v.kind() != first.kind()) {
                return Err("most_restrictive ordering mixes value kinds".into());
            }
            for (i, v) in least_to_most.iter().enumerate() {
                if least_to_most[..i].contains(v) {
                    return Err(format!("most_restrictive ordering repeats {}", v));
                }
            }
        }
        Ok(())
    }
}

/// Position in the ordering; unlisted values rank below every listed value.
fn restriction_rank(least_to_most: &[PolicyValue], value: &PolicyValue) -> Option<usize> {
    least_to_most.iter().position(|v| v == value)
}
