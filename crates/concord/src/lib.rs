//! Concord Root Library
//!
//! Wires the policy engine, capability validators and notification
//! dispatcher together from a [`RootConfig`], and replays scripted admin
//! operations against the result.
//!
//! # Architecture
//!
//! The root is a thin orchestrator. [`Concord::from_config`] builds the
//! mechanism registry (built-in catalog plus configured policies), the
//! validator chain and the dispatcher, then hands them to the engine.
//! Operations arrive as [`Operation`] values, typically one JSON object per
//! line of a replay script.

pub mod config;
pub mod error;

pub use config::{CapabilitiesConfig, EngineConfig, NotifyConfig, RootConfig};
pub use error::{RootError, RootResult};

use concord_core::{
    AdminIdentity, CoreResult, NotificationSink, PolicyKey, PolicyUpdate, PolicyValue,
};
use concord_notify::{
    DispatcherConfig, DispatcherStats, InMemoryNotificationSink, NotificationDispatcher,
    TracingNotificationSink,
};
use concord_policy::{
    ClearResult, DevicePolicyState, ExclusiveMembership, HardwareCapabilities,
    MechanismRegistryBuilder, PolicyEngine, SetResult, ValidatorChain,
};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// One admin-side operation, as read from a replay script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Set {
        key: PolicyKey,
        admin: AdminIdentity,
        value: PolicyValue,
        /// Falls back to `engine.default_importance`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        importance: Option<i32>,
    },
    Clear {
        key: PolicyKey,
        admin: AdminIdentity,
    },
    RemoveAdmin {
        admin: AdminIdentity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationOutcome {
    Set(SetResult),
    Clear(ClearResult),
    RemoveAdmin { affected: Vec<PolicyKey> },
    /// The engine refused the operation without touching state.
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStep {
    /// 1-based line number in the script.
    pub line: usize,
    pub operation: Operation,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub steps: Vec<ReplayStep>,
    pub final_state: DevicePolicyState,
    pub notifications: DispatcherStats,
}

// ---------------------------------------------------------------------------
// SinkFanout: deliver admin updates to several sinks
// ---------------------------------------------------------------------------

/// Every sink sees every update; the first failure is reported after all
/// of them have run.
struct SinkFanout(Vec<Arc<dyn NotificationSink>>);

impl NotificationSink for SinkFanout {
    fn notify(&self, update: &PolicyUpdate) -> CoreResult<()> {
        let mut first_error = None;
        for sink in &self.0 {
            if let Err(e) = sink.notify(update) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Concord: the assembled runtime
// ---------------------------------------------------------------------------

pub struct Concord {
    config: RootConfig,
    engine: PolicyEngine,
    dispatcher: Arc<NotificationDispatcher>,
    admin_updates: Arc<InMemoryNotificationSink>,
}

impl Concord {
    pub fn from_config(config: RootConfig) -> RootResult<Self> {
        config.validate()?;

        let mut builder = if config.engine.include_builtin_catalog {
            MechanismRegistryBuilder::with_builtin_catalog()
        } else {
            MechanismRegistryBuilder::new()
        };
        for definition in &config.policies {
            builder.register_or_replace(definition.clone())?;
        }
        let registry = Arc::new(builder.build());

        let mut validators = ValidatorChain::new();
        if !config.capabilities.unsupported.is_empty() {
            validators = validators.with(HardwareCapabilities::new(
                config.capabilities.unsupported.iter().map(String::as_str),
            ));
        }
        if !config.capabilities.exclusive_membership.is_empty() {
            validators = validators.with(ExclusiveMembership::new(
                config
                    .capabilities
                    .exclusive_membership
                    .iter()
                    .map(String::as_str),
            ));
        }

        let admin_updates = Arc::new(InMemoryNotificationSink::with_capacity(
            config.notify.admin_update_history,
        ));
        let mut admin_sinks: Vec<Arc<dyn NotificationSink>> = vec![admin_updates.clone()];
        if config.notify.log_updates {
            admin_sinks.push(Arc::new(TracingNotificationSink));
        }
        let dispatcher = Arc::new(NotificationDispatcher::with_config(
            Arc::new(SinkFanout(admin_sinks)),
            DispatcherConfig {
                failure_threshold: config.notify.listener_failure_threshold,
                recovery_timeout_seconds: config.notify.listener_recovery_secs,
                mailbox_idle_millis: config.notify.mailbox_idle_millis,
            },
        )?);
        if config.notify.log_updates {
            dispatcher.subscribe(Arc::new(TracingNotificationSink));
        }

        info!(
            policy_types = registry.len(),
            validators = validators.len(),
            "concord initialized"
        );

        let engine = PolicyEngine::new(registry)
            .with_validator(Arc::new(validators))
            .with_sink(dispatcher.clone());

        Ok(Self {
            config,
            engine,
            dispatcher,
            admin_updates,
        })
    }

    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// The most recent admin-addressed updates, up to
    /// `notify.admin_update_history` of them.
    pub fn admin_updates(&self) -> Vec<PolicyUpdate> {
        self.admin_updates.updates()
    }

    pub fn apply(&self, operation: &Operation) -> RootResult<OperationOutcome> {
        match operation {
            Operation::Set {
                key,
                admin,
                value,
                importance,
            } => {
                let importance = importance.unwrap_or(self.config.engine.default_importance);
                let result = self
                    .engine
                    .set_policy(key, admin, value.clone(), importance)?;
                Ok(OperationOutcome::Set(result))
            }
            Operation::Clear { key, admin } => {
                Ok(OperationOutcome::Clear(self.engine.clear_policy(key, admin)))
            }
            Operation::RemoveAdmin { admin } => Ok(OperationOutcome::RemoveAdmin {
                affected: self.engine.on_admin_removed(admin),
            }),
        }
    }

    /// Run a JSON-lines script of operations. Blank lines and lines starting
    /// with `#` are skipped. A malformed line aborts the replay; an operation
    /// the engine refuses is recorded as `Failed` and the replay continues.
    pub fn replay<R: BufRead>(&self, reader: R) -> RootResult<ReplayReport> {
        let mut steps = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let operation: Operation = serde_json::from_str(trimmed).map_err(|e| {
                RootError::Serialization(format!("line {}: {}", index + 1, e))
            })?;
            let outcome = match self.apply(&operation) {
                Ok(outcome) => outcome,
                Err(RootError::Policy(e)) => {
                    warn!(line = index + 1, error = %e, "operation refused");
                    OperationOutcome::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };
            steps.push(ReplayStep {
                line: index + 1,
                operation,
                outcome,
            });
        }

        if !self.settle(Duration::from_secs(10)) {
            warn!("notifications still pending after replay");
        }
        Ok(ReplayReport {
            steps,
            final_state: self.engine.device_policy_state(),
            notifications: self.dispatcher.stats(),
        })
    }

    /// Wait for queued notifications to be delivered.
    pub fn settle(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_idle(timeout)
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{
        Audience, CoreError, PolicyScope, PolicyScopeKind, PolicyUpdateResult, SequenceNumber,
        UserId,
    };
    use concord_policy::{catalog, MechanismKind, PolicyDefinition};

    fn quiet_config() -> RootConfig {
        let mut config = RootConfig::default();
        config.notify.log_updates = false;
        config
    }

    #[test]
    fn test_from_default_config_has_catalog() {
        let concord = Concord::from_config(quiet_config()).unwrap();
        assert_eq!(
            concord.engine().registry().len(),
            catalog::builtin_definitions().len()
        );
    }

    #[test]
    fn test_custom_policy_without_catalog() {
        let mut config = quiet_config();
        config.engine.include_builtin_catalog = false;
        config.policies.push(PolicyDefinition::new(
            "kiosk-mode",
            MechanismKind::TopmostAuthority,
            PolicyScopeKind::Global,
        ));
        let concord = Concord::from_config(config).unwrap();
        assert_eq!(concord.engine().registry().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = quiet_config();
        config.notify.listener_failure_threshold = 0;
        assert!(matches!(
            Concord::from_config(config),
            Err(RootError::Config(_))
        ));
    }

    #[test]
    fn test_apply_uses_default_importance() {
        let mut config = quiet_config();
        config.engine.default_importance = 4;
        let concord = Concord::from_config(config).unwrap();
        let key = PolicyKey::new(catalog::LOCK_TASK);
        let admin = AdminIdentity::new("com.dpc", 0);
        concord
            .apply(&Operation::Set {
                key: key.clone(),
                admin: admin.clone(),
                value: PolicyValue::from("com.kiosk"),
                importance: None,
            })
            .unwrap();
        let state = concord.engine().get_policy_state(&key).unwrap();
        assert_eq!(state.entry(&admin).unwrap().importance, 4);
    }

    #[test]
    fn test_operation_json_format() {
        let line = r#"{"op":"set","key":{"identifier":"camera-disabled"},"admin":{"package":"com.a","user_id":0},"value":{"type":"boolean","value":true}}"#;
        let op: Operation = serde_json::from_str(line).unwrap();
        assert_eq!(
            op,
            Operation::Set {
                key: PolicyKey::new("camera-disabled"),
                admin: AdminIdentity::new("com.a", 0),
                value: PolicyValue::Boolean(true),
                importance: None,
            }
        );
        let remove: Operation =
            serde_json::from_str(r#"{"op":"remove_admin","admin":{"package":"com.a","user_id":0}}"#)
                .unwrap();
        assert!(matches!(remove, Operation::RemoveAdmin { .. }));
    }

    #[test]
    fn test_replay_records_failures_and_continues() {
        let concord = Concord::from_config(quiet_config()).unwrap();
        let script = r#"
# two admins disagree on the camera
{"op":"set","key":{"identifier":"camera-disabled"},"admin":{"package":"com.a","user_id":0},"value":{"type":"boolean","value":false}}
{"op":"set","key":{"identifier":"camera-disabled"},"admin":{"package":"com.b","user_id":0},"value":{"type":"boolean","value":true}}
{"op":"set","key":{"identifier":"no-such-policy"},"admin":{"package":"com.b","user_id":0},"value":{"type":"boolean","value":true}}
{"op":"clear","key":{"identifier":"camera-disabled"},"admin":{"package":"com.b","user_id":0}}
"#;
        let report = concord.replay(script.as_bytes()).unwrap();
        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.steps[0].line, 3);
        assert!(matches!(
            &report.steps[2].outcome,
            OperationOutcome::Failed { kind, .. } if kind == "UnknownPolicyType"
        ));
        let state = report
            .final_state
            .get(
                &PolicyKey::new("camera-disabled"),
                PolicyScope::User(UserId::SYSTEM),
            )
            .unwrap();
        assert_eq!(state.resolved_value, Some(PolicyValue::Boolean(false)));
        assert_eq!(report.notifications.pending, 0);

        let cleared = concord
            .admin_updates()
            .into_iter()
            .filter(|u| u.outcome == PolicyUpdateResult::PolicyCleared)
            .count();
        assert_eq!(cleared, 1);
    }

    struct OfflineSink;

    impl NotificationSink for OfflineSink {
        fn notify(&self, _update: &PolicyUpdate) -> CoreResult<()> {
            Err(CoreError::Sink("offline".into()))
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink_past_a_failure() {
        let recorder = Arc::new(InMemoryNotificationSink::new());
        let fanout = SinkFanout(vec![
            Arc::new(OfflineSink),
            recorder.clone(),
            Arc::new(OfflineSink),
        ]);
        let update = PolicyUpdate::new(
            PolicyKey::new(catalog::CAMERA_DISABLED),
            PolicyScope::User(UserId::SYSTEM),
            Audience::Local,
            PolicyUpdateResult::PolicySet,
            Some(PolicyValue::Boolean(true)),
            SequenceNumber(1),
        );
        assert!(matches!(fanout.notify(&update), Err(CoreError::Sink(_))));
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_admin_update_history_is_bounded() {
        let mut config = quiet_config();
        config.notify.admin_update_history = 3;
        let concord = Concord::from_config(config).unwrap();
        let key = PolicyKey::new(catalog::CAMERA_DISABLED);
        for i in 0..6 {
            let admin = AdminIdentity::new(format!("com.admin{}", i), 0);
            concord
                .engine()
                .set_policy(&key, &admin, PolicyValue::Boolean(i % 2 == 1), 0)
                .unwrap();
        }
        assert!(concord.settle(Duration::from_secs(5)));
        assert_eq!(concord.admin_updates().len(), 3);
    }

    #[test]
    fn test_replay_aborts_on_malformed_line() {
        let concord = Concord::from_config(quiet_config()).unwrap();
        let err = concord.replay("{\"op\":\"explode\"}\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
