//! End-to-end coexistence scenarios: several admins, one device.
//!
//! This test tells a story:
//!
//! 1. A device owner and a work-profile admin both manage auto timezone
//! 2. Two apps with input-method permission take turns setting the list
//! 3. A kiosk controller and a helper app both pin lock task, then get uninstalled
//! 4. Two network admins try to claim the same UID for different slices
//! 5. A 2G restriction lands on a device without a 2G radio
//! 6. Many admins hammer the same key from different threads
//!
//! Every chapter goes through the assembled runtime: registry from the
//! built-in catalog, validators from config, and the per-key dispatcher
//! delivering notifications off the engine's call path.

use concord::{Concord, RootConfig};
use concord_core::{
    AdminIdentity, Audience, NotificationSink, PolicyKey, PolicyScope, PolicyUpdateResult,
    PolicyValue, UserId,
};
use concord_notify::InMemoryNotificationSink;
use concord_policy::catalog;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn runtime(config: RootConfig) -> Concord {
    let mut config = config;
    config.notify.log_updates = false;
    Concord::from_config(config).unwrap()
}

fn listen(concord: &Concord) -> Arc<InMemoryNotificationSink> {
    let listener = Arc::new(InMemoryNotificationSink::new());
    concord
        .dispatcher()
        .subscribe(listener.clone() as Arc<dyn NotificationSink>);
    listener
}

// ============================================================================
// Chapter 1: most restrictive wins, and stays until the last admin lets go
// ============================================================================

#[test]
fn chapter_1_auto_timezone_most_restrictive() {
    let concord = runtime(RootConfig::default());
    let engine = concord.engine();
    let listener = listen(&concord);
    let key = PolicyKey::new(catalog::AUTO_TIMEZONE);
    let owner = AdminIdentity::new("com.example.dpc", 0);
    let work = AdminIdentity::new("com.example.work", 10);

    engine
        .set_policy(&key, &owner, PolicyValue::Boolean(false), 0)
        .unwrap();
    let result = engine
        .set_policy(&key, &work, PolicyValue::Boolean(true), 0)
        .unwrap();
    assert!(result.resolved_changed);
    assert_eq!(engine.get_resolved_policy(&key), Some(PolicyValue::Boolean(true)));

    // The owner comes around; the work admin leaves. Still enforced.
    engine
        .set_policy(&key, &owner, PolicyValue::Boolean(true), 0)
        .unwrap();
    engine.clear_policy(&key, &work);
    assert_eq!(engine.get_resolved_policy(&key), Some(PolicyValue::Boolean(true)));

    engine.clear_policy(&key, &owner);
    assert_eq!(engine.get_resolved_policy(&key), None);

    assert!(concord.settle(WAIT));
    let local = listener.updates_for(&key);
    assert!(local.iter().all(|u| u.audience == Audience::Local));
    assert!(local.iter().all(|u| u.scope == PolicyScope::Global));
    assert_eq!(
        local.last().map(|u| u.resolved_value.clone()),
        Some(None),
        "last local update reports the policy gone"
    );
}

// ============================================================================
// Chapter 2: most recent, and what happens when the latest setter unsets
// ============================================================================

#[test]
fn chapter_2_input_methods_most_recent() {
    let concord = runtime(RootConfig::default());
    let engine = concord.engine();
    let key = PolicyKey::new(catalog::PERMITTED_INPUT_METHODS);
    let first = AdminIdentity::permission_based("com.example.first", 0);
    let second = AdminIdentity::permission_based("com.example.second", 0);
    let x = PolicyValue::string_set(["com.ime.latin"]);
    let y = PolicyValue::string_set(["com.ime.kana"]);

    engine.set_policy(&key, &first, x.clone(), 0).unwrap();
    engine.set_policy(&key, &second, y.clone(), 0).unwrap();
    assert_eq!(engine.get_resolved_policy(&key), Some(y));

    // bothSetThenOneUnsets_setsToPrevious
    engine
        .set_policy(&key, &second, PolicyValue::Unset, 0)
        .unwrap();
    assert_eq!(engine.get_resolved_policy(&key), Some(x));

    // bothUnsets_unsets
    engine.set_policy(&key, &first, PolicyValue::Unset, 0).unwrap();
    assert_eq!(engine.get_resolved_policy(&key), None);
    assert!(engine.get_policy_state(&key).is_none());
}

// ============================================================================
// Chapter 3: topmost authority survives the helper's removal
// ============================================================================

#[test]
fn chapter_3_lock_task_survives_admin_removal() {
    let concord = runtime(RootConfig::default());
    let engine = concord.engine();
    let key = PolicyKey::new(catalog::LOCK_TASK);
    let kiosk = AdminIdentity::new("com.example.kiosk", 0);
    let helper = AdminIdentity::permission_based("com.example.helper", 0);
    let pinned = PolicyValue::from("com.example.kiosk.app");

    engine.set_policy(&key, &kiosk, pinned.clone(), 100).unwrap();
    engine.set_policy(&key, &helper, pinned.clone(), 1).unwrap();

    // DPCRemoved_stillEnforced, lower authority first.
    assert_eq!(engine.on_admin_removed(&helper), vec![key.clone()]);
    assert_eq!(engine.get_resolved_policy(&key), Some(pinned));

    assert_eq!(engine.on_admin_removed(&kiosk), vec![key.clone()]);
    assert_eq!(engine.get_resolved_policy(&key), None);

    assert!(concord.settle(WAIT));
    assert!(concord
        .admin_updates()
        .iter()
        .all(|u| u.admin() != Some(&kiosk) || u.outcome == PolicyUpdateResult::PolicySet));
}

// ============================================================================
// Chapter 4: overlapping UID slices are refused without partial apply
// ============================================================================

#[test]
fn chapter_4_exclusive_uids_rejected() {
    let mut config = RootConfig::default();
    config.capabilities.exclusive_membership = vec![catalog::PREFERENTIAL_NETWORK_SERVICE.into()];
    let concord = runtime(config);
    let engine = concord.engine();
    let key = PolicyKey::with_parameter(catalog::PREFERENTIAL_NETWORK_SERVICE, "enterprise-1");
    let first = AdminIdentity::new("com.example.net1", 0);
    let second = AdminIdentity::new("com.example.net2", 0);

    engine
        .set_policy(&key, &first, PolicyValue::string_set(["10001", "10002"]), 0)
        .unwrap();
    let before = engine.get_policy_state(&key).unwrap();

    let result = engine
        .set_policy(&key, &second, PolicyValue::string_set(["10002"]), 0)
        .unwrap();
    assert!(!result.accepted);
    assert!(result.clone().into_result().is_err());

    let after = engine.get_policy_state(&key).unwrap();
    assert_eq!(after.entries, before.entries);
    assert_eq!(after.resolved_value, before.resolved_value);

    assert!(concord.settle(WAIT));
    let to_second: Vec<_> = concord
        .admin_updates()
        .into_iter()
        .filter(|u| u.admin() == Some(&second))
        .collect();
    assert_eq!(to_second.len(), 1);
    assert_eq!(
        to_second[0].outcome,
        PolicyUpdateResult::FailureConflictingAdminPolicy
    );
}

// ============================================================================
// Chapter 5: hardware that cannot comply says so
// ============================================================================

#[test]
fn chapter_5_hardware_limitation_reported() {
    let no_2g = catalog::user_restriction_identifier("no_cellular_2g");
    let mut config = RootConfig::default();
    config.capabilities.unsupported = vec![no_2g.to_string()];
    let concord = runtime(config);
    let engine = concord.engine();
    let admin = AdminIdentity::new("com.example.dpc", 10);

    let global = PolicyKey::new(no_2g);
    let result = engine
        .set_policy(&global, &admin, PolicyValue::Boolean(true), 0)
        .unwrap();
    assert_eq!(result.outcome, PolicyUpdateResult::FailureHardwareLimitation);

    // A supported local restriction goes through and targets the admin's user.
    let local = PolicyKey::new(catalog::user_restriction_identifier("no_config_wifi"));
    let ok = engine
        .set_policy(&local, &admin, PolicyValue::Boolean(true), 0)
        .unwrap();
    assert_eq!(ok.outcome, PolicyUpdateResult::PolicySet);

    assert!(concord.settle(WAIT));
    let updates = concord.admin_updates();
    let failure = updates.iter().find(|u| u.key == global).unwrap();
    assert_eq!(failure.outcome, PolicyUpdateResult::FailureHardwareLimitation);
    assert_eq!(failure.outcome.code(), 4);
    assert_eq!(failure.scope.target_user_id(), -1);

    let set = updates.iter().find(|u| u.key == local).unwrap();
    assert_eq!(set.outcome, PolicyUpdateResult::PolicySet);
    assert_eq!(set.scope, PolicyScope::User(UserId(10)));
}

// ============================================================================
// Chapter 6: concurrent admins, no lost updates, ordered notifications
// ============================================================================

#[test]
fn chapter_6_concurrent_admins_same_key() {
    let concord = runtime(RootConfig::default());
    let listener = listen(&concord);
    let key = PolicyKey::with_parameter(catalog::PERMISSION_GRANT, "android.permission.CAMERA");

    std::thread::scope(|s| {
        for i in 0..24i64 {
            let concord = &concord;
            let key = &key;
            s.spawn(move || {
                let admin = AdminIdentity::new(format!("com.example.admin{}", i), 0);
                concord
                    .engine()
                    .set_policy(key, &admin, PolicyValue::Integer(i % 3), 0)
                    .unwrap();
            });
        }
    });

    let state = concord.engine().get_policy_state(&key).unwrap();
    assert_eq!(state.len(), 24);
    assert_eq!(
        state.resolved_value,
        Some(PolicyValue::Integer(catalog::PERMISSION_GRANT_DENIED))
    );
    assert_eq!(
        concord.engine().get_resolved_policy(&key),
        state.resolved_value
    );

    assert!(concord.settle(WAIT));
    let sequences: Vec<u64> = listener
        .updates_for(&key)
        .iter()
        .map(|u| u.sequence.0)
        .collect();
    assert!(!sequences.is_empty());
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

// ============================================================================
// Chapter 7: the device-wide snapshot
// ============================================================================

#[test]
fn chapter_7_device_policy_state() {
    let concord = runtime(RootConfig::default());
    let engine = concord.engine();
    let admin = AdminIdentity::new("com.example.dpc", 0);

    engine
        .set_policy(
            &PolicyKey::with_parameter(catalog::PACKAGE_UNINSTALL_BLOCKED, "com.example.app"),
            &admin,
            PolicyValue::Boolean(true),
            0,
        )
        .unwrap();
    engine
        .set_policy(
            &PolicyKey::new(catalog::USER_CONTROL_DISABLED_PACKAGES),
            &admin,
            PolicyValue::string_set(["com.example.app"]),
            0,
        )
        .unwrap();

    let device = engine.device_policy_state();
    assert_eq!(device.len(), 2);
    let json = serde_json::to_value(&device).unwrap();
    let restored: concord_policy::DevicePolicyState = serde_json::from_value(json).unwrap();
    assert_eq!(restored, device);
}

// ============================================================================
// Chapter 8: a personal profile and a work profile keep their own camera
// ============================================================================

#[test]
fn chapter_8_per_user_policies_do_not_collide() {
    let concord = runtime(RootConfig::default());
    let engine = concord.engine();
    let key = PolicyKey::new(catalog::CAMERA_DISABLED);
    let personal = AdminIdentity::new("com.example.personal", 0);
    let work = AdminIdentity::new("com.example.work", 10);

    engine
        .set_policy(&key, &personal, PolicyValue::Boolean(false), 0)
        .unwrap();
    let result = engine
        .set_policy(&key, &work, PolicyValue::Boolean(true), 0)
        .unwrap();
    assert_eq!(result.outcome, PolicyUpdateResult::PolicySet);

    assert_eq!(
        engine.get_resolved_policy_for(&key, UserId(0)),
        Some(PolicyValue::Boolean(false))
    );
    assert_eq!(
        engine.get_resolved_policy_for(&key, UserId(10)),
        Some(PolicyValue::Boolean(true))
    );

    assert!(concord.settle(WAIT));
    let updates = concord.admin_updates();
    assert!(updates
        .iter()
        .filter(|u| u.admin() == Some(&personal))
        .all(|u| u.outcome == PolicyUpdateResult::PolicySet
            && u.scope == PolicyScope::User(UserId(0))));

    let device = engine.device_policy_state();
    assert_eq!(device.policies_for_user(UserId(10)).count(), 1);
    assert_eq!(device.policies_for_user(UserId(0)).count(), 1);
}
