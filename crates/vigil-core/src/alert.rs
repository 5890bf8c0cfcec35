use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule::{Rule, Severity};

/// Alert lifecycle status.
///
/// `Resolved` is terminal: acknowledging or resolving a resolved alert is a
/// no-op that returns the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Active => write!(f, "active"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            _ => Err(format!("Unknown alert status: {}", s)),
        }
    }
}

/// A fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: Uuid,
    /// Rule name at firing time; survives rule edits and soft deletes.
    pub rule_name: String,
    pub source: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub description: Option<String>,
    /// Metric value observed at the last evaluation.
    pub value: f64,
    /// Threshold observed at firing time.
    pub threshold: f64,
    /// Dedup identity: hash of (rule_id, sorted labels).
    pub fingerprint: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl Alert {
    /// Create a firing alert from a rule and the observed value.
    pub fn firing(rule: &Rule, value: f64, now: DateTime<Utc>) -> Self {
        let message = format!(
            "{}: {} {} {} (observed {})",
            rule.name, rule.expression, rule.operator, rule.threshold, value
        );

        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            source: rule.source.clone(),
            severity: rule.severity,
            status: AlertStatus::Active,
            message,
            description: rule.description.clone(),
            value,
            threshold: rule.threshold,
            fingerprint: rule.fingerprint(),
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            resolved_at: None,
            acknowledged_by: None,
        }
    }

    /// Whether the alert still counts against fingerprint uniqueness.
    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }

    /// Acknowledge the alert. Returns false when the status did not change
    /// (already acknowledged or already resolved).
    pub fn acknowledge(&mut self, by: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status != AlertStatus::Active {
            return false;
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_by = Some(by.into());
        self.updated_at = now;
        true
    }

    /// Resolve the alert. Returns false when already resolved.
    pub fn resolve(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AlertStatus::Resolved {
            return false;
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Refresh the observed value on an already-open alert.
    pub fn refresh(&mut self, value: f64, now: DateTime<Utc>) {
        self.value = value;
        self.updated_at = now;
    }
}
