use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Timestamp: canonical time representation (seconds + nanoseconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds_since_epoch: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            seconds_since_epoch: now.timestamp() as u64,
            nanoseconds: now.timestamp_subsec_nanos(),
        }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: 0,
        }
    }

    pub fn to_rfc3339(&self) -> String {
        let dt =
            chrono::DateTime::from_timestamp(self.seconds_since_epoch as i64, self.nanoseconds);
        dt.map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "invalid".to_string())
    }
}

// ---------------------------------------------------------------------------
// SequenceNumber: engine-wide serialization order
// ---------------------------------------------------------------------------

/// Position of a mutation in the engine's total order.
///
/// Assigned at the per-key serialization point from a single counter, so two
/// mutations never share a value. Recency comparisons use this, never
/// wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Typed identifiers
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    PolicyIdentifier,
    "Name of a policy type, e.g. `package-uninstall-blocked`."
);

/// Identifier of a notification event. 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        use rand::RngCore;
        use sha2::{Digest, Sha256};
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let hash = Sha256::digest(bytes);
        Self(hex::encode(&hash[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user (or profile) on the managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl UserId {
    /// The device's primary user.
    pub const SYSTEM: UserId = UserId(0);
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PolicyKey: identifier plus optional parameter
// ---------------------------------------------------------------------------

/// Immutable identifier of one policy instance.
///
/// `package-uninstall-blocked` parameterised by `com.example.app` is a
/// different key from the same identifier parameterised by another package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub identifier: PolicyIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl PolicyKey {
    /// Key for a policy that takes no parameter.
    pub fn new(identifier: impl Into<PolicyIdentifier>) -> Self {
        Self {
            identifier: identifier.into(),
            parameter: None,
        }
    }

    pub fn with_parameter(
        identifier: impl Into<PolicyIdentifier>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            parameter: Some(parameter.into()),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parameter {
            Some(p) => write!(f, "{}[{}]", self.identifier, p),
            None => write!(f, "{}", self.identifier),
        }
    }
}

// ---------------------------------------------------------------------------
// AdminIdentity: who set a policy
// ---------------------------------------------------------------------------

/// A policy-setting authority: a package running as a given user, either a
/// device/profile controller or an app holding a policy permission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub package: String,
    pub user_id: UserId,
    #[serde(default)]
    pub permission_based: bool,
}

impl AdminIdentity {
    pub fn new(package: impl Into<String>, user_id: u32) -> Self {
        Self {
            package: package.into(),
            user_id: UserId(user_id),
            permission_based: false,
        }
    }

    /// An admin that acts through a granted permission rather than an admin component.
    pub fn permission_based(package: impl Into<String>, user_id: u32) -> Self {
        Self {
            permission_based: true,
            ..Self::new(package, user_id)
        }
    }
}

impl fmt::Display for AdminIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@u{}", self.package, self.user_id)?;
        if self.permission_based {
            write!(f, "(perm)")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PolicyValue: the tagged union of admin-settable values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Boolean,
    Integer,
    String,
    StringSet,
    Unset,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Boolean => write!(f, "boolean"),
            ValueKind::Integer => write!(f, "integer"),
            ValueKind::String => write!(f, "string"),
            ValueKind::StringSet => write!(f, "string_set"),
            ValueKind::Unset => write!(f, "unset"),
        }
    }
}

/// A policy value as set by one admin.
///
/// `Unset` is the explicit "clear my value" sentinel. It is distinct from a
/// policy that was never set and is never stored as an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PolicyValue {
    Boolean(bool),
    Integer(i64),
    String(String),
    StringSet(BTreeSet<String>),
    Unset,
}

impl PolicyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PolicyValue::Boolean(_) => ValueKind::Boolean,
            PolicyValue::Integer(_) => ValueKind::Integer,
            PolicyValue::String(_) => ValueKind::String,
            PolicyValue::StringSet(_) => ValueKind::StringSet,
            PolicyValue::Unset => ValueKind::Unset,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, PolicyValue::Unset)
    }

    pub fn string_set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PolicyValue::StringSet(items.into_iter().map(Into::into).collect())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PolicyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            PolicyValue::StringSet(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyValue::Boolean(b) => write!(f, "{}", b),
            PolicyValue::Integer(i) => write!(f, "{}", i),
            PolicyValue::String(s) => write!(f, "{:?}", s),
            PolicyValue::StringSet(set) => {
                write!(f, "{{")?;
                for (i, item) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "}}")
            }
            PolicyValue::Unset => write!(f, "<unset>"),
        }
    }
}

impl From<bool> for PolicyValue {
    fn from(b: bool) -> Self {
        PolicyValue::Boolean(b)
    }
}

impl From<i64> for PolicyValue {
    fn from(i: i64) -> Self {
        PolicyValue::Integer(i)
    }
}

impl From<&str> for PolicyValue {
    fn from(s: &str) -> Self {
        PolicyValue::String(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Scope: where a resolved policy takes effect
// ---------------------------------------------------------------------------

/// Whether a policy type applies device-wide or per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScopeKind {
    Global,
    #[default]
    Local,
}

/// Target of a single notification: the whole device, or one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    User(UserId),
}

impl PolicyScope {
    /// Resolve the notification target for a policy type acted on by `admin`.
    pub fn for_admin(kind: PolicyScopeKind, admin: &AdminIdentity) -> Self {
        Self::for_user(kind, admin.user_id)
    }

    /// Where a policy type in force for `user` is held.
    pub fn for_user(kind: PolicyScopeKind, user: UserId) -> Self {
        match kind {
            PolicyScopeKind::Global => PolicyScope::Global,
            PolicyScopeKind::Local => PolicyScope::User(user),
        }
    }

    /// True if a policy held at this scope is in force for `user`.
    pub fn applies_to(&self, user: UserId) -> bool {
        match self {
            PolicyScope::Global => true,
            PolicyScope::User(u) => *u == user,
        }
    }

    /// Wire-compatible target user id: `-1` for global.
    pub fn target_user_id(&self) -> i64 {
        match self {
            PolicyScope::Global => -1,
            PolicyScope::User(u) => i64::from(u.0),
        }
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Global => write!(f, "global"),
            PolicyScope::User(u) => write!(f, "user:{}", u),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyUpdateResult: outcome codes delivered to admins
// ---------------------------------------------------------------------------

/// Outcome of a policy operation as reported to an admin.
///
/// Numeric codes follow the platform's public result constants so they can
/// be passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyUpdateResult {
    FailureUnknown,
    PolicySet,
    FailureConflictingAdminPolicy,
    PolicyCleared,
    FailureStorageLimitReached,
    FailureHardwareLimitation,
}

impl PolicyUpdateResult {
    pub fn code(self) -> i32 {
        match self {
            PolicyUpdateResult::FailureUnknown => -1,
            PolicyUpdateResult::PolicySet => 0,
            PolicyUpdateResult::FailureConflictingAdminPolicy => 1,
            PolicyUpdateResult::PolicyCleared => 2,
            PolicyUpdateResult::FailureStorageLimitReached => 3,
            PolicyUpdateResult::FailureHardwareLimitation => 4,
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            PolicyUpdateResult::PolicySet | PolicyUpdateResult::PolicyCleared
        )
    }
}

impl fmt::Display for PolicyUpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyUpdateResult::FailureUnknown => "FAILURE_UNKNOWN",
            PolicyUpdateResult::PolicySet => "POLICY_SET",
            PolicyUpdateResult::FailureConflictingAdminPolicy => {
                "FAILURE_CONFLICTING_ADMIN_POLICY"
            }
            PolicyUpdateResult::PolicyCleared => "POLICY_CLEARED",
            PolicyUpdateResult::FailureStorageLimitReached => "FAILURE_STORAGE_LIMIT_REACHED",
            PolicyUpdateResult::FailureHardwareLimitation => "FAILURE_HARDWARE_LIMITATION",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// RejectionReason: why a capability validator declined a value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The device cannot honour this policy value.
    HardwareLimitation(String),
    /// The value contradicts another admin's policy (e.g. overlapping exclusive sets).
    ConflictingPolicy(String),
    /// Per-policy storage quota exhausted.
    StorageLimitReached(String),
    Other(String),
}

impl RejectionReason {
    /// The failure code an admin receives for this rejection.
    pub fn outcome(&self) -> PolicyUpdateResult {
        match self {
            RejectionReason::HardwareLimitation(_) => {
                PolicyUpdateResult::FailureHardwareLimitation
            }
            RejectionReason::ConflictingPolicy(_) => {
                PolicyUpdateResult::FailureConflictingAdminPolicy
            }
            RejectionReason::StorageLimitReached(_) => {
                PolicyUpdateResult::FailureStorageLimitReached
            }
            RejectionReason::Other(_) => PolicyUpdateResult::FailureUnknown,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::HardwareLimitation(d) => write!(f, "hardware limitation: {}", d),
            RejectionReason::ConflictingPolicy(d) => write!(f, "conflicting policy: {}", d),
            RejectionReason::StorageLimitReached(d) => write!(f, "storage limit reached: {}", d),
            RejectionReason::Other(d) => write!(f, "{}", d),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyUpdate: one notification emitted by the engine
// ---------------------------------------------------------------------------

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "admin", rename_all = "snake_case")]
pub enum Audience {
    /// An admin holding (or attempting to hold) an entry for the key.
    Admin(AdminIdentity),
    /// In-process listeners interested in "state under this key changed".
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub event_id: EventId,
    pub key: PolicyKey,
    pub scope: PolicyScope,
    pub audience: Audience,
    pub outcome: PolicyUpdateResult,
    /// Resolved value after the operation; `None` once every admin has cleared.
    pub resolved_value: Option<PolicyValue>,
    /// Serialization point of the operation that produced this update.
    pub sequence: SequenceNumber,
    pub emitted_at: Timestamp,
}

impl PolicyUpdate {
    pub fn new(
        key: PolicyKey,
        scope: PolicyScope,
        audience: Audience,
        outcome: PolicyUpdateResult,
        resolved_value: Option<PolicyValue>,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            key,
            scope,
            audience,
            outcome,
            resolved_value,
            sequence,
            emitted_at: Timestamp::now(),
        }
    }

    pub fn admin(&self) -> Option<&AdminIdentity> {
        match &self.audience {
            Audience::Admin(a) => Some(a),
            Audience::Local => None,
        }
    }
}
