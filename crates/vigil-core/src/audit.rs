use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::rule::Severity;

/// Zero digest used as the previous hash of the genesis entry.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Field separator inside the canonical byte form.
const SEP: u8 = 0x1f;

/// Closed audit event taxonomy, prefix-grouped by subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AuthLogin,
    AuthLogout,
    AuthLoginFailed,
    AuthPasswordChanged,
    AuthTokenRefreshed,
    AuthSessionExpired,
    ParamUpdate,
    ParamBulkUpdate,
    ParamReset,
    CircuitPause,
    CircuitResume,
    CircuitTriggered,
    EmergencyPause,
    EmergencyResume,
    EmergencyAction,
    AlertRuleCreated,
    AlertRuleUpdated,
    AlertRuleDeleted,
    AlertAcknowledged,
    AlertResolved,
    UpgradeScheduled,
    UpgradeExecuted,
    UpgradeCancelled,
    UpgradeFailed,
    AccessRoleAssigned,
    AccessRoleRevoked,
    AccessPermissionGranted,
    AccessPermissionRevoked,
}

impl AuditEventType {
    /// All variants, for stats grouping and validation.
    pub const ALL: [AuditEventType; 28] = [
        Self::AuthLogin,
        Self::AuthLogout,
        Self::AuthLoginFailed,
        Self::AuthPasswordChanged,
        Self::AuthTokenRefreshed,
        Self::AuthSessionExpired,
        Self::ParamUpdate,
        Self::ParamBulkUpdate,
        Self::ParamReset,
        Self::CircuitPause,
        Self::CircuitResume,
        Self::CircuitTriggered,
        Self::EmergencyPause,
        Self::EmergencyResume,
        Self::EmergencyAction,
        Self::AlertRuleCreated,
        Self::AlertRuleUpdated,
        Self::AlertRuleDeleted,
        Self::AlertAcknowledged,
        Self::AlertResolved,
        Self::UpgradeScheduled,
        Self::UpgradeExecuted,
        Self::UpgradeCancelled,
        Self::UpgradeFailed,
        Self::AccessRoleAssigned,
        Self::AccessRoleRevoked,
        Self::AccessPermissionGranted,
        Self::AccessPermissionRevoked,
    ];

    /// Dotted wire name, e.g. `auth.login`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthLogin => "auth.login",
            Self::AuthLogout => "auth.logout",
            Self::AuthLoginFailed => "auth.login_failed",
            Self::AuthPasswordChanged => "auth.password_changed",
            Self::AuthTokenRefreshed => "auth.token_refreshed",
            Self::AuthSessionExpired => "auth.session_expired",
            Self::ParamUpdate => "param.update",
            Self::ParamBulkUpdate => "param.bulk_update",
            Self::ParamReset => "param.reset",
            Self::CircuitPause => "circuit.pause",
            Self::CircuitResume => "circuit.resume",
            Self::CircuitTriggered => "circuit.triggered",
            Self::EmergencyPause => "emergency.pause",
            Self::EmergencyResume => "emergency.resume",
            Self::EmergencyAction => "emergency.action",
            Self::AlertRuleCreated => "alert.rule_created",
            Self::AlertRuleUpdated => "alert.rule_updated",
            Self::AlertRuleDeleted => "alert.rule_deleted",
            Self::AlertAcknowledged => "alert.acknowledged",
            Self::AlertResolved => "alert.resolved",
            Self::UpgradeScheduled => "upgrade.scheduled",
            Self::UpgradeExecuted => "upgrade.executed",
            Self::UpgradeCancelled => "upgrade.cancelled",
            Self::UpgradeFailed => "upgrade.failed",
            Self::AccessRoleAssigned => "access.role_assigned",
            Self::AccessRoleRevoked => "access.role_revoked",
            Self::AccessPermissionGranted => "access.permission_granted",
            Self::AccessPermissionRevoked => "access.permission_revoked",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown audit event type: {}", s))
    }
}

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Partial,
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditResult::Success => write!(f, "success"),
            AuditResult::Failure => write!(f, "failure"),
            AuditResult::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(AuditResult::Success),
            "failure" => Ok(AuditResult::Failure),
            "partial" => Ok(AuditResult::Partial),
            _ => Err(format!("Unknown audit result: {}", s)),
        }
    }
}

/// Principal that triggered the audited action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    pub user_id: String,
    pub user_email: String,
    pub user_role: String,
}

impl AuditActor {
    pub fn new(
        user_id: impl Into<String>,
        user_email: impl Into<String>,
        user_role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: user_email.into(),
            user_role: user_role.into(),
        }
    }

    /// Actor for events the service emits on its own behalf.
    pub fn system() -> Self {
        Self::new("system", "system@vigil", "system")
    }
}

/// Fields supplied by the producer of an audit event; the ledger fills in
/// id, timestamp, and the chain hashes at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub actor: AuditActor,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub changes: HashMap<String, serde_json::Value>,
    pub ip_address: String,
    pub user_agent: String,
    pub session_id: String,
    pub result: AuditResult,
    pub severity: Severity,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    /// Minimal successful event.
    pub fn new(
        event_type: AuditEventType,
        actor: AuditActor,
        action: impl Into<String>,
        resource: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            actor,
            action: action.into(),
            resource: resource.into(),
            resource_id: resource_id.into(),
            previous_value: None,
            new_value: None,
            changes: HashMap::new(),
            ip_address: String::new(),
            user_agent: String::new(),
            session_id: String::new(),
            result: AuditResult::Success,
            severity: Severity::Info,
            error_message: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_values(
        mut self,
        previous: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> Self {
        self.previous_value = previous;
        self.new_value = new;
        self
    }

    pub fn with_request_context(
        mut self,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        self.ip_address = ip.into();
        self.user_agent = user_agent.into();
        self.session_id = session_id.into();
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// One immutable row of the hash-chained audit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor: AuditActor,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub changes: HashMap<String, serde_json::Value>,
    pub ip_address: String,
    pub user_agent: String,
    pub session_id: String,
    pub result: AuditResult,
    pub severity: Severity,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, String>,
    /// SHA-256 over the canonical byte form, committing to `previous_hash`.
    pub hash: [u8; 32],
    /// Hash of the immediately preceding entry; zero for genesis.
    pub previous_hash: [u8; 32],
}

impl AuditEntry {
    /// Materialize an entry from producer fields, chaining onto
    /// `previous_hash`.
    pub fn from_event(
        event: AuditEvent,
        id: Uuid,
        timestamp: DateTime<Utc>,
        previous_hash: [u8; 32],
    ) -> Self {
        let mut entry = Self {
            id,
            timestamp,
            event_type: event.event_type,
            actor: event.actor,
            action: event.action,
            resource: event.resource,
            resource_id: event.resource_id,
            previous_value: event.previous_value,
            new_value: event.new_value,
            changes: event.changes,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            session_id: event.session_id,
            result: event.result,
            severity: event.severity,
            error_message: event.error_message,
            metadata: event.metadata,
            hash: [0u8; 32],
            previous_hash,
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Recompute the canonical hash from the stored fields.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();

        let mut field = |bytes: &[u8]| {
            hasher.update(bytes);
            hasher.update([SEP]);
        };

        field(self.id.as_bytes());
        field(&self.timestamp.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        field(self.event_type.as_str().as_bytes());
        field(self.actor.user_id.as_bytes());
        field(self.actor.user_email.as_bytes());
        field(self.actor.user_role.as_bytes());
        field(self.action.as_bytes());
        field(self.resource.as_bytes());
        field(self.resource_id.as_bytes());
        field(canonical_json_opt(self.previous_value.as_ref()).as_bytes());
        field(canonical_json_opt(self.new_value.as_ref()).as_bytes());
        field(canonical_map(&self.changes).as_bytes());
        field(self.ip_address.as_bytes());
        field(self.user_agent.as_bytes());
        field(self.session_id.as_bytes());
        field(self.result.to_string().as_bytes());
        field(self.severity.to_string().as_bytes());
        field(self.error_message.as_deref().unwrap_or("").as_bytes());
        field(canonical_string_map(&self.metadata).as_bytes());
        field(&self.previous_hash);

        hasher.finalize().into()
    }

    /// Whether the stored hash matches the recomputed one.
    pub fn is_self_consistent(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Whether this entry is the chain genesis.
    pub fn is_genesis(&self) -> bool {
        self.previous_hash == GENESIS_HASH
    }
}

/// Canonical JSON text with lexicographically sorted object keys at every
/// nesting level, so serialization order can never change the hash.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn canonical_json_opt(value: Option<&serde_json::Value>) -> String {
    value.map(canonical_json).unwrap_or_default()
}

fn canonical_map(map: &HashMap<String, serde_json::Value>) -> String {
    let mut keys: Vec<_> = map.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("{}={};", k, canonical_json(&map[k])))
        .collect()
}

fn canonical_string_map(map: &HashMap<String, String>) -> String {
    let mut keys: Vec<_> = map.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("{}={};", k, map[k]))
        .collect()
}
