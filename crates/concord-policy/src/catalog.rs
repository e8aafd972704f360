//! Built-in device policy catalog.
//!
//! Binds each known policy type to the mechanism that reconciles it and to
//! the scope it takes effect in. Deployments extend or override these
//! through configuration before the registry is frozen.

use concord_core::{PolicyIdentifier, PolicyScopeKind, PolicyValue};

use crate::types::{MechanismKind, PolicyDefinition};

pub const AUTO_TIMEZONE: &str = "auto-timezone";
pub const AUTO_TIME: &str = "auto-time";
pub const PACKAGE_UNINSTALL_BLOCKED: &str = "package-uninstall-blocked";
pub const APPLICATION_HIDDEN: &str = "application-hidden";
pub const PERMITTED_INPUT_METHODS: &str = "permitted-input-methods";
pub const PERMITTED_ACCESSIBILITY_SERVICES: &str = "permitted-accessibility-services";
pub const ACCOUNT_MANAGEMENT_DISABLED: &str = "account-management-disabled";
pub const SCREEN_CAPTURE_DISABLED: &str = "screen-capture-disabled";
pub const CAMERA_DISABLED: &str = "camera-disabled";
pub const LOCK_TASK: &str = "lock-task";
pub const PERSISTENT_PREFERRED_ACTIVITY: &str = "persistent-preferred-activity";
pub const USER_CONTROL_DISABLED_PACKAGES: &str = "user-control-disabled-packages";
pub const PERMISSION_GRANT: &str = "permission-grant";
pub const PREFERENTIAL_NETWORK_SERVICE: &str = "preferential-network-service";
pub const CROSS_PROFILE_WIDGET_PROVIDERS: &str = "cross-profile-widget-providers";
pub const BACKUP_SERVICE_ENABLED: &str = "backup-service-enabled";

/// Permission grant states, in increasing order of restriction.
pub const PERMISSION_GRANT_DEFAULT: i64 = 0;
pub const PERMISSION_GRANT_GRANTED: i64 = 1;
pub const PERMISSION_GRANT_DENIED: i64 = 2;

const USER_RESTRICTION_PREFIX: &str = "user-restriction/";

/// Restrictions that apply to a single user.
pub const LOCAL_USER_RESTRICTIONS: &[&str] = &[
    "no_config_wifi",
    "no_outgoing_calls",
    "no_bluetooth",
    "no_bluetooth_sharing",
    "no_sms",
    "no_modify_accounts",
    "no_config_tethering",
    "no_config_mobile_networks",
    "no_config_cell_broadcasts",
    "no_config_bluetooth",
    "no_config_date_time",
    "no_cross_profile_copy_paste",
    "no_install_apps",
    "no_uninstall_apps",
    "no_adjust_volume",
    "no_usb_file_transfer",
    "no_unmute_microphone",
    "no_autofill",
    "no_share_into_managed_profile",
    "no_fun",
];

/// Restrictions that always apply device-wide.
pub const GLOBAL_USER_RESTRICTIONS: &[&str] = &[
    "no_cellular_2g",
    "no_ultra_wideband_radio",
    "no_wifi_direct",
    "no_wifi_tethering",
    "no_change_wifi_state",
    "no_add_wifi_config",
    "no_data_roaming",
    "no_add_user",
    "no_add_managed_profile",
    "no_add_clone_profile",
    "no_factory_reset",
    "no_safe_boot",
    "no_network_reset",
];

/// Policy identifier for a named user restriction, e.g. `user-restriction/no_sms`.
pub fn user_restriction_identifier(restriction: &str) -> PolicyIdentifier {
    PolicyIdentifier::new(format!("{}{}", USER_RESTRICTION_PREFIX, restriction))
}

/// Mechanism for permission grant state: denied beats granted beats default.
pub fn permission_grant_mechanism() -> MechanismKind {
    MechanismKind::MostRestrictive {
        least_to_most: vec![
            PolicyValue::Integer(PERMISSION_GRANT_DEFAULT),
            PolicyValue::Integer(PERMISSION_GRANT_GRANTED),
            PolicyValue::Integer(PERMISSION_GRANT_DENIED),
        ],
    }
}

pub fn builtin_definitions() -> Vec<PolicyDefinition> {
    use PolicyScopeKind::{Global, Local};

    let restrictive = MechanismKind::true_more_restrictive;
    let mut definitions = vec![
        PolicyDefinition::new(AUTO_TIMEZONE, restrictive(), Global),
        PolicyDefinition::new(AUTO_TIME, restrictive(), Global),
        PolicyDefinition::new(PACKAGE_UNINSTALL_BLOCKED, restrictive(), Local),
        PolicyDefinition::new(APPLICATION_HIDDEN, restrictive(), Local),
        PolicyDefinition::new(PERMITTED_INPUT_METHODS, MechanismKind::MostRecent, Local),
        PolicyDefinition::new(
            PERMITTED_ACCESSIBILITY_SERVICES,
            MechanismKind::MostRecent,
            Local,
        ),
        PolicyDefinition::new(ACCOUNT_MANAGEMENT_DISABLED, restrictive(), Local),
        // Reported device-wide when the device owner sets it.
        PolicyDefinition::new(SCREEN_CAPTURE_DISABLED, restrictive(), Global),
        PolicyDefinition::new(CAMERA_DISABLED, restrictive(), Local),
        PolicyDefinition::new(LOCK_TASK, MechanismKind::TopmostAuthority, Local),
        PolicyDefinition::new(
            PERSISTENT_PREFERRED_ACTIVITY,
            MechanismKind::TopmostAuthority,
            Local,
        ),
        PolicyDefinition::new(
            USER_CONTROL_DISABLED_PACKAGES,
            MechanismKind::StringSetUnion,
            Global,
        ),
        PolicyDefinition::new(PERMISSION_GRANT, permission_grant_mechanism(), Local),
        PolicyDefinition::new(PREFERENTIAL_NETWORK_SERVICE, MechanismKind::MostRecent, Local),
        PolicyDefinition::new(
            CROSS_PROFILE_WIDGET_PROVIDERS,
            MechanismKind::StringSetUnion,
            Local,
        ),
        // Backup stays enabled only if no admin turned it off.
        PolicyDefinition::new(
            BACKUP_SERVICE_ENABLED,
            MechanismKind::false_more_restrictive(),
            Local,
        ),
    ];

    for restriction in LOCAL_USER_RESTRICTIONS {
        definitions.push(PolicyDefinition {
            identifier: user_restriction_identifier(restriction),
            mechanism: restrictive(),
            scope: Local,
        });
    }
    for restriction in GLOBAL_USER_RESTRICTIONS {
        definitions.push(PolicyDefinition {
            identifier: user_restriction_identifier(restriction),
            mechanism: restrictive(),
            scope: Global,
        });
    }
    definitions
}
