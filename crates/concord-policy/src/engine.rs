use concord_core::{
    AdminIdentity, Audience, CapabilityCheck, CapabilityValidator, DiscardSink, ExistingValue,
    NotificationSink, PolicyKey, PolicyScope, PolicyUpdate, PolicyUpdateResult, PolicyValue,
    SequenceNumber, Timestamp, UserId, ValidationContext,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{PolicyError, PolicyResult};
use crate::registry::MechanismRegistry;
use crate::types::{
    ClearResult, DevicePolicyState, PolicyDefinition, PolicyEntry, PolicyState, SetResult,
};
use crate::validator::AcceptAll;

/// A key together with the target its entries are enforced at. Per-user
/// policies get one slot per user; global policies get one slot.
type SlotId = (PolicyKey, PolicyScope);

// ---------------------------------------------------------------------------
// KeySlot: per-key serialization point and published snapshot
// ---------------------------------------------------------------------------

/// Mutations of one key hold `write` for their whole read-modify-publish
/// sequence. Readers only ever touch `published`.
///
/// The flag under `write` is set once the slot has been emptied and dropped
/// from the engine's map; a writer that finds it set looks the slot up again.
#[derive(Default)]
struct KeySlot {
    write: Mutex<bool>,
    published: RwLock<Option<Arc<PolicyState>>>,
}

impl KeySlot {
    fn load(&self) -> Option<Arc<PolicyState>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: Option<PolicyState>) -> Option<Arc<PolicyState>> {
        debug_assert!(state.as_ref().map_or(true, |s| {
            !s.entries.is_empty() && s.resolved_value == s.mechanism.resolve(s.entries.values())
        }));
        let state = state.map(Arc::new);
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state.clone();
        state
    }
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Reconciles policy values set by several admins into one resolved value
/// per key.
///
/// Global policy types resolve once for the device. Per-user policy types
/// resolve separately for each user, from the entries of admins on that
/// user, so admins of different users never compete.
///
/// Mutations of the same key are serialized; different keys proceed in
/// parallel. Readers observe immutable snapshots and never block writers of
/// other keys. Notifications are handed to the sink while the key is still
/// held, so a sink that only enqueues sees same-key updates in order.
pub struct PolicyEngine {
    registry: Arc<MechanismRegistry>,
    validator: Arc<dyn CapabilityValidator>,
    sink: Arc<dyn NotificationSink>,
    slots: RwLock<HashMap<SlotId, Arc<KeySlot>>>,
    sequence: AtomicU64,
}

impl PolicyEngine {
    /// Create an engine over `registry` that accepts every value and
    /// discards notifications.
    pub fn new(registry: Arc<MechanismRegistry>) -> Self {
        Self {
            registry,
            validator: Arc::new(AcceptAll),
            sink: Arc::new(DiscardSink),
            slots: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Set the capability validator consulted before a value is stored.
    pub fn with_validator(mut self, validator: Arc<dyn CapabilityValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set the sink that receives every policy update.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The policy types this engine resolves.
    pub fn registry(&self) -> &MechanismRegistry {
        &self.registry
    }

    /// Last sequence number handed out.
    pub fn last_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Record `admin`'s value for `key` and re-resolve.
    ///
    /// For per-user policy types the value counts towards `admin`'s user
    /// only. `PolicyValue::Unset` clears the admin's entry. A validator
    /// rejection is returned as `Ok` with `accepted == false`; use
    /// [`SetResult::into_result`] to treat it as an error.
    pub fn set_policy(
        &self,
        key: &PolicyKey,
        admin: &AdminIdentity,
        value: PolicyValue,
        importance: i32,
    ) -> PolicyResult<SetResult> {
        let definition = self
            .registry
            .lookup(&key.identifier)
            .ok_or_else(|| PolicyError::UnknownPolicyType(key.identifier.to_string()))?;

        if value.is_unset() {
            return Ok(self.clear_policy(key, admin).into());
        }

        let kind = value.kind();
        if let Some(expected) = definition.mechanism.required_kind() {
            if expected != kind {
                return Err(PolicyError::TypeMismatch {
                    key: key.clone(),
                    expected,
                    actual: kind,
                });
            }
        }

        let id = (key.clone(), PolicyScope::for_admin(definition.scope, admin));
        loop {
            let slot = self.slot(&id);
            let stored = self.mutate(&id, &slot, |slot| {
                self.store(slot, &id, definition, admin, &value, importance)
            });
            if let Some(result) = stored {
                return result;
            }
        }
    }

    /// Remove `admin`'s entry for `key`. A no-op if it holds none.
    pub fn clear_policy(&self, key: &PolicyKey, admin: &AdminIdentity) -> ClearResult {
        let Some(definition) = self.registry.lookup(&key.identifier) else {
            return ClearResult::default();
        };
        let id = (key.clone(), PolicyScope::for_admin(definition.scope, admin));
        loop {
            let Some(slot) = self.existing_slot(&id) else {
                return ClearResult::default();
            };
            let cleared = self.mutate(&id, &slot, |slot| {
                let Some(current) = slot.load() else {
                    return ClearResult::default();
                };
                if current.entry(admin).is_none() {
                    return ClearResult::default();
                }
                self.remove_entry(slot, &current, admin, true)
            });
            if let Some(result) = cleared {
                tracing::debug!(
                    key = %key,
                    admin = %admin,
                    changed = result.resolved_changed,
                    "policy cleared"
                );
                return result;
            }
        }
    }

    /// Drop every entry owned by `admin`, one key at a time. Returns the
    /// affected keys in order.
    pub fn on_admin_removed(&self, admin: &AdminIdentity) -> Vec<PolicyKey> {
        let slots: Vec<(SlotId, Arc<KeySlot>)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, target), _)| target.applies_to(admin.user_id))
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut affected = Vec::new();
        for (id, slot) in slots {
            let removed = self.mutate(&id, &slot, |slot| {
                let Some(current) = slot.load() else {
                    return false;
                };
                if current.entry(admin).is_none() {
                    return false;
                }
                self.remove_entry(slot, &current, admin, false);
                true
            });
            if removed == Some(true) {
                affected.push(id.0);
            }
        }
        affected.sort();

        tracing::info!(
            admin = %admin,
            keys = affected.len(),
            "admin removed"
        );
        affected
    }

    /// Resolved value of `key` for the system user. Global policy types have
    /// the same value for every user.
    pub fn get_resolved_policy(&self, key: &PolicyKey) -> Option<PolicyValue> {
        self.get_resolved_policy_for(key, UserId::SYSTEM)
    }

    /// Resolved value of `key` in force for `user`.
    pub fn get_resolved_policy_for(&self, key: &PolicyKey, user: UserId) -> Option<PolicyValue> {
        self.get_policy_state_for(key, user)
            .and_then(|s| s.resolved_value.clone())
    }

    /// Point-in-time snapshot of `key` for the system user, or `None` if no
    /// admin holds an entry.
    pub fn get_policy_state(&self, key: &PolicyKey) -> Option<Arc<PolicyState>> {
        self.get_policy_state_for(key, UserId::SYSTEM)
    }

    pub fn get_policy_state_for(&self, key: &PolicyKey, user: UserId) -> Option<Arc<PolicyState>> {
        let definition = self.registry.lookup(&key.identifier)?;
        let target = PolicyScope::for_user(definition.scope, user);
        self.existing_slot(&(key.clone(), target))
            .and_then(|slot| slot.load())
    }

    /// Snapshot of every key with at least one entry, per target.
    pub fn device_policy_state(&self) -> DevicePolicyState {
        let policies = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|slot| slot.load())
            .map(|state| state.as_ref().clone())
            .collect();
        DevicePolicyState::new(policies)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, id: &SlotId) -> Arc<KeySlot> {
        if let Some(slot) = self.existing_slot(id) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, id: &SlotId) -> Option<Arc<KeySlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Run `f` with `slot` held for writing. Returns `None` without calling
    /// `f` if the slot was retired while we waited for it. A slot that `f`
    /// leaves empty is dropped from the map before its lock is released.
    fn mutate<R>(
        &self,
        id: &SlotId,
        slot: &Arc<KeySlot>,
        f: impl FnOnce(&KeySlot) -> R,
    ) -> Option<R> {
        let mut retired = slot.write.lock().unwrap_or_else(PoisonError::into_inner);
        if *retired {
            return None;
        }
        let result = f(&**slot);
        if slot.load().is_none() {
            *retired = true;
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if slots.get(id).map_or(false, |s| Arc::ptr_eq(s, slot)) {
                slots.remove(id);
            }
        }
        Some(result)
    }

    fn next_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Caller holds the slot's write lock.
    fn store(
        &self,
        slot: &KeySlot,
        (key, target): &SlotId,
        definition: &PolicyDefinition,
        admin: &AdminIdentity,
        value: &PolicyValue,
        importance: i32,
    ) -> PolicyResult<SetResult> {
        let kind = value.kind();
        let scope = *target;
        let current = slot.load();

        if let Some(expected) = current.as_ref().and_then(|s| s.value_kind) {
            if expected != kind {
                return Err(PolicyError::TypeMismatch {
                    key: key.clone(),
                    expected,
                    actual: kind,
                });
            }
        }

        let previous = current.as_ref().and_then(|s| s.resolved_value.clone());

        let existing: Vec<ExistingValue<'_>> = current
            .iter()
            .flat_map(|s| s.entries.values())
            .filter(|e| &e.admin != admin)
            .map(|e| ExistingValue {
                admin: &e.admin,
                value: &e.value,
            })
            .collect();
        let check = self.validator.can_apply(&ValidationContext {
            key,
            admin,
            value,
            existing: &existing,
        });

        let seq = self.next_sequence();

        if let CapabilityCheck::Rejected(reason) = check {
            tracing::info!(
                key = %key,
                admin = %admin,
                reason = %reason,
                "policy value rejected"
            );
            self.emit(PolicyUpdate::new(
                key.clone(),
                scope,
                Audience::Admin(admin.clone()),
                reason.outcome(),
                previous.clone(),
                seq,
            ));
            return Ok(SetResult::rejected(reason, previous));
        }

        let mut entries = current
            .as_ref()
            .map(|s| s.entries.clone())
            .unwrap_or_default();
        entries.insert(
            admin.clone(),
            PolicyEntry {
                admin: admin.clone(),
                value: value.clone(),
                importance,
                set_at: seq,
                set_at_time: Timestamp::now(),
            },
        );
        let resolved = definition.mechanism.resolve(entries.values());
        let state = slot
            .publish(Some(PolicyState {
                key: key.clone(),
                scope: definition.scope,
                target: scope,
                entries,
                resolved_value: resolved.clone(),
                mechanism: definition.mechanism.clone(),
                value_kind: Some(kind),
            }))
            .ok_or_else(|| PolicyError::Internal(format!("no snapshot published for {}", key)))?;

        let changed = previous != resolved;
        let honoured = resolved
            .as_ref()
            .map_or(false, |r| definition.mechanism.honours(r, value));

        tracing::debug!(
            key = %key,
            admin = %admin,
            target = %scope,
            value = %value,
            sequence = %seq,
            changed,
            "policy set"
        );

        if changed {
            self.notify_resolution(&state, scope, seq);
        } else if !honoured {
            self.emit(PolicyUpdate::new(
                key.clone(),
                scope,
                Audience::Admin(admin.clone()),
                PolicyUpdateResult::FailureConflictingAdminPolicy,
                resolved.clone(),
                seq,
            ));
        }

        Ok(SetResult {
            accepted: true,
            resolved_changed: changed,
            outcome: if honoured {
                PolicyUpdateResult::PolicySet
            } else {
                PolicyUpdateResult::FailureConflictingAdminPolicy
            },
            rejection: None,
            resolved_value: resolved,
        })
    }

    /// Caller holds the slot's write lock and has checked `admin` has an entry.
    fn remove_entry(
        &self,
        slot: &KeySlot,
        current: &PolicyState,
        admin: &AdminIdentity,
        notify_admin: bool,
    ) -> ClearResult {
        let seq = self.next_sequence();
        let scope = current.target;
        let previous = current.resolved_value.clone();

        let mut entries: BTreeMap<AdminIdentity, PolicyEntry> = current.entries.clone();
        entries.remove(admin);

        let published = if entries.is_empty() {
            slot.publish(None)
        } else {
            let resolved = current.mechanism.resolve(entries.values());
            slot.publish(Some(PolicyState {
                entries,
                resolved_value: resolved,
                ..current.clone()
            }))
        };
        let resolved = published.as_ref().and_then(|s| s.resolved_value.clone());
        let changed = previous != resolved;

        if changed {
            if notify_admin {
                self.emit(PolicyUpdate::new(
                    current.key.clone(),
                    scope,
                    Audience::Admin(admin.clone()),
                    PolicyUpdateResult::PolicyCleared,
                    resolved.clone(),
                    seq,
                ));
            }
            match &published {
                Some(state) => self.notify_resolution(state, scope, seq),
                None => self.emit(PolicyUpdate::new(
                    current.key.clone(),
                    scope,
                    Audience::Local,
                    PolicyUpdateResult::PolicyCleared,
                    None,
                    seq,
                )),
            }
        }

        ClearResult {
            removed: true,
            resolved_changed: changed,
            resolved_value: resolved,
        }
    }

    /// Tell every holder whether its value is enforced, then local listeners.
    fn notify_resolution(&self, state: &PolicyState, scope: PolicyScope, seq: SequenceNumber) {
        for entry in state.entries.values() {
            let honoured = state
                .resolved_value
                .as_ref()
                .map_or(false, |r| state.mechanism.honours(r, &entry.value));
            self.emit(PolicyUpdate::new(
                state.key.clone(),
                scope,
                Audience::Admin(entry.admin.clone()),
                if honoured {
                    PolicyUpdateResult::PolicySet
                } else {
                    PolicyUpdateResult::FailureConflictingAdminPolicy
                },
                state.resolved_value.clone(),
                seq,
            ));
        }
        self.emit(PolicyUpdate::new(
            state.key.clone(),
            scope,
            Audience::Local,
            if state.resolved_value.is_some() {
                PolicyUpdateResult::PolicySet
            } else {
                PolicyUpdateResult::PolicyCleared
            },
            state.resolved_value.clone(),
            seq,
        ));
    }

    fn emit(&self, update: PolicyUpdate) {
        if let Err(e) = self.sink.notify(&update) {
            tracing::warn!(
                key = %update.key,
                outcome = %update.outcome,
                error = %e,
                "notification sink failed"
            );
        }
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("policy_types", &self.registry.len())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}
