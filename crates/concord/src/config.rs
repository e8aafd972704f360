use concord_policy::PolicyDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{RootError, RootResult};

/// Configuration for the policy engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Register the built-in device policy catalog before custom policies.
    #[serde(default = "default_true")]
    pub include_builtin_catalog: bool,

    /// Importance used by replayed `set` operations that do not carry one.
    #[serde(default)]
    pub default_importance: i32,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            include_builtin_catalog: true,
            default_importance: 0,
        }
    }
}

/// Configuration for notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyConfig {
    /// Consecutive listener failures before its circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub listener_failure_threshold: u32,

    /// Seconds before an open listener circuit lets a trial delivery through.
    #[serde(default = "default_recovery_secs")]
    pub listener_recovery_secs: u64,

    /// Log every delivered update through `tracing`.
    #[serde(default = "default_true")]
    pub log_updates: bool,

    /// Milliseconds a key's notification mailbox may sit idle before its
    /// worker thread exits.
    #[serde(default = "default_mailbox_idle_millis")]
    pub mailbox_idle_millis: u64,

    /// Admin-addressed updates kept in memory for inspection.
    #[serde(default = "default_admin_update_history")]
    pub admin_update_history: usize,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_secs() -> u64 {
    60
}

fn default_mailbox_idle_millis() -> u64 {
    10_000
}

fn default_admin_update_history() -> usize {
    1024
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            listener_failure_threshold: default_failure_threshold(),
            listener_recovery_secs: default_recovery_secs(),
            log_updates: true,
            mailbox_idle_millis: default_mailbox_idle_millis(),
            admin_update_history: default_admin_update_history(),
        }
    }
}

/// Device capabilities consulted before a value is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilitiesConfig {
    /// Policy identifiers the hardware cannot honour.
    #[serde(default)]
    pub unsupported: Vec<String>,

    /// Policy identifiers whose string-set values must not overlap across admins.
    #[serde(default)]
    pub exclusive_membership: Vec<String>,
}

/// Top-level configuration for the concord binary.
///
/// Loaded from a TOML file (typically `~/.concord/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    /// Policy types added to (or overriding) the built-in catalog.
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl RootConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: RootConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RootResult<()> {
        if self.notify.listener_failure_threshold == 0 {
            return Err(RootError::Config(
                "listener_failure_threshold must be > 0".into(),
            ));
        }
        if self.notify.mailbox_idle_millis == 0 {
            return Err(RootError::Config("mailbox_idle_millis must be > 0".into()));
        }
        if self.notify.admin_update_history == 0 {
            return Err(RootError::Config("admin_update_history must be > 0".into()));
        }
        for id in self
            .capabilities
            .unsupported
            .iter()
            .chain(&self.capabilities.exclusive_membership)
        {
            if id.trim().is_empty() {
                return Err(RootError::Config(
                    "capability policy identifiers must not be empty".into(),
                ));
            }
        }
        let mut seen = HashSet::new();
        for definition in &self.policies {
            if !seen.insert(&definition.identifier) {
                return Err(RootError::Config(format!(
                    "policy '{}' is defined more than once",
                    definition.identifier
                )));
            }
            definition.mechanism.validate().map_err(|e| {
                RootError::Config(format!("policy '{}': {}", definition.identifier, e))
            })?;
        }
        Ok(())
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".concord/config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{PolicyScopeKind, PolicyValue};
    use concord_policy::MechanismKind;

    #[test]
    fn test_default_config() {
        let config = RootConfig::default();
        assert!(config.engine.include_builtin_catalog);
        assert_eq!(config.engine.default_importance, 0);
        assert_eq!(config.notify.listener_failure_threshold, 5);
        assert_eq!(config.notify.listener_recovery_secs, 60);
        assert!(config.notify.log_updates);
        assert_eq!(config.notify.admin_update_history, 1024);
        assert_eq!(config.notify.mailbox_idle_millis, 10_000);
        assert!(config.capabilities.unsupported.is_empty());
        assert!(config.policies.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[engine]
include_builtin_catalog = false
default_importance = 3

[notify]
listener_failure_threshold = 2
log_updates = false

[capabilities]
unsupported = ["user-restriction/no_cellular_2g"]
exclusive_membership = ["preferential-network-service"]

[[policies]]
identifier = "kiosk-mode"
mechanism = "topmost_authority"
scope = "global"

[[policies]]
identifier = "wifi-locked"
mechanism = "most_restrictive"
least_to_most = [
    { type = "boolean", value = false },
    { type = "boolean", value = true },
]
"#;
        let config: RootConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.engine.include_builtin_catalog);
        assert_eq!(config.engine.default_importance, 3);
        assert_eq!(config.notify.listener_failure_threshold, 2);
        assert_eq!(config.notify.listener_recovery_secs, 60);
        assert!(!config.notify.log_updates);
        assert_eq!(
            config.capabilities.unsupported,
            vec!["user-restriction/no_cellular_2g".to_string()]
        );
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies[0].mechanism, MechanismKind::TopmostAuthority);
        assert_eq!(config.policies[0].scope, PolicyScopeKind::Global);
        assert_eq!(
            config.policies[1].mechanism,
            MechanismKind::true_more_restrictive()
        );
        assert_eq!(config.policies[1].scope, PolicyScopeKind::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_zero_threshold() {
        let mut config = RootConfig::default();
        config.notify.listener_failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_limits() {
        let mut config = RootConfig::default();
        config.notify.admin_update_history = 0;
        assert!(config.validate().is_err());

        let mut config = RootConfig::default();
        config.notify.mailbox_idle_millis = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_duplicate_policy() {
        let mut config = RootConfig::default();
        let def = PolicyDefinition::new("kiosk", MechanismKind::MostRecent, PolicyScopeKind::Local);
        config.policies = vec![def.clone(), def];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_config_validate_malformed_mechanism() {
        let mut config = RootConfig::default();
        config.policies.push(PolicyDefinition::new(
            "broken",
            MechanismKind::MostRestrictive {
                least_to_most: vec![],
            },
            PolicyScopeKind::Local,
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_empty_capability_identifier() {
        let mut config = RootConfig::default();
        config.capabilities.exclusive_membership.push("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = RootConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, RootConfig::default());
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\ninclude_builtin_catalog = ").unwrap();
        assert!(matches!(RootConfig::load(&path), Err(RootError::Config(_))));
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RootConfig::default();
        config.engine.default_importance = 7;
        config.capabilities.unsupported = vec!["camera-disabled".into()];
        config.policies.push(PolicyDefinition::new(
            "kiosk-mode",
            MechanismKind::MostRecent,
            PolicyScopeKind::Global,
        ));

        config.save(&path).unwrap();
        let loaded = RootConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_default_config_path() {
        let path = RootConfig::default_config_path();
        assert!(path.ends_with(".concord/config.toml"));
    }

    #[test]
    fn test_policy_value_in_toml_ordering() {
        let toml_str = r#"
[[policies]]
identifier = "grant-state"
mechanism = "most_restrictive"
least_to_most = [
    { type = "integer", value = 0 },
    { type = "integer", value = 2 },
]
"#;
        let config: RootConfig = toml::from_str(toml_str).unwrap();
        match &config.policies[0].mechanism {
            MechanismKind::MostRestrictive { least_to_most } => {
                assert_eq!(least_to_most[1], PolicyValue::Integer(2));
            }
            other => panic!("unexpected mechanism {}", other),
        }
    }
}
