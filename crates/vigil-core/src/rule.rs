use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Threshold comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Ge,
    /// Less than or equal
    Le,
    /// Equal
    Eq,
    /// Not equal
    Ne,
}

impl ThresholdOp {
    /// Evaluate the comparison.
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOp::Gt => value > threshold,
            ThresholdOp::Lt => value < threshold,
            ThresholdOp::Ge => value >= threshold,
            ThresholdOp::Le => value <= threshold,
            ThresholdOp::Eq => (value - threshold).abs() < f64::EPSILON,
            ThresholdOp::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl std::fmt::Display for ThresholdOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdOp::Gt => write!(f, "gt"),
            ThresholdOp::Lt => write!(f, "lt"),
            ThresholdOp::Ge => write!(f, "ge"),
            ThresholdOp::Le => write!(f, "le"),
            ThresholdOp::Eq => write!(f, "eq"),
            ThresholdOp::Ne => write!(f, "ne"),
        }
    }
}

impl std::str::FromStr for ThresholdOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gt" | ">" => Ok(ThresholdOp::Gt),
            "lt" | "<" => Ok(ThresholdOp::Lt),
            "ge" | "gte" | ">=" => Ok(ThresholdOp::Ge),
            "le" | "lte" | "<=" => Ok(ThresholdOp::Le),
            "eq" | "==" => Ok(ThresholdOp::Eq),
            "ne" | "!=" => Ok(ThresholdOp::Ne),
            _ => Err(format!("Unknown operator: {}", s)),
        }
    }
}

/// Alert rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Metric expression handed to the metrics provider.
    pub expression: String,
    pub operator: ThresholdOp,
    pub threshold: f64,
    pub severity: Severity,
    /// Origin tag carried onto alerts (e.g. "validator", "bridge").
    pub source: String,
    /// Minimum continuous violation before an alert may fire, in seconds.
    pub for_duration_secs: u64,
    /// Per-rule evaluation cadence in seconds; 0 falls back to the driver tick.
    pub interval_secs: u64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Channel ids notified when this rule fires.
    pub channels: Vec<Uuid>,
    pub enabled: bool,
    /// Soft-delete marker; deleted rules keep their historical alerts.
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Create a new rule with defaults.
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        operator: ThresholdOp,
        threshold: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            expression: expression.into(),
            operator,
            threshold,
            severity: Severity::Warning,
            source: "default".to_string(),
            for_duration_secs: 0,
            interval_secs: 0,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            channels: Vec::new(),
            enabled: true,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the minimum continuous violation time.
    pub fn with_for_duration(mut self, seconds: u64) -> Self {
        self.for_duration_secs = seconds;
        self
    }

    /// Set the source tag.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a notification channel.
    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channels.push(channel_id);
        self
    }

    pub fn for_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.for_duration_secs as i64)
    }

    /// Fingerprint identifying alert equivalence for this rule.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.id, &self.labels)
    }
}

/// Deterministic digest of a rule id plus its sorted label set.
///
/// Two firings with the same rule and labels share a fingerprint and are
/// candidates for deduplication.
pub fn fingerprint(rule_id: Uuid, labels: &HashMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());

    let mut keys: Vec<_> = labels.keys().collect();
    keys.sort();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(labels[key].as_bytes());
        hasher.update([0x1f]);
    }

    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_op_evaluate() {
        assert!(ThresholdOp::Gt.evaluate(10.0, 5.0));
        assert!(!ThresholdOp::Gt.evaluate(5.0, 10.0));

        assert!(ThresholdOp::Ge.evaluate(10.0, 10.0));
        assert!(ThresholdOp::Ge.evaluate(10.0, 5.0));

        assert!(ThresholdOp::Lt.evaluate(5.0, 10.0));
        assert!(!ThresholdOp::Lt.evaluate(10.0, 5.0));

        assert!(ThresholdOp::Le.evaluate(10.0, 10.0));
        assert!(ThresholdOp::Le.evaluate(5.0, 10.0));

        assert!(ThresholdOp::Eq.evaluate(10.0, 10.0));
        assert!(!ThresholdOp::Eq.evaluate(10.0, 5.0));

        assert!(ThresholdOp::Ne.evaluate(10.0, 5.0));
        assert!(!ThresholdOp::Ne.evaluate(10.0, 10.0));
    }

    #[test]
    fn test_operator_round_trip() {
        for op in ["gt", "lt", "ge", "le", "eq", "ne"] {
            let parsed: ThresholdOp = op.parse().unwrap();
            assert_eq!(parsed.to_string(), op);
        }
        assert_eq!(">".parse::<ThresholdOp>().unwrap(), ThresholdOp::Gt);
        assert!("between".parse::<ThresholdOp>().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn test_rule_builder() {
        let rule = Rule::new("high_cpu", "cpu_usage_percent", ThresholdOp::Gt, 90.0)
            .with_severity(Severity::Critical)
            .with_for_duration(60)
            .with_source("node")
            .with_label("region", "eu-west");

        assert_eq!(rule.name, "high_cpu");
        assert_eq!(rule.threshold, 90.0);
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(rule.for_duration_secs, 60);
        assert_eq!(rule.source, "node");
        assert!(rule.enabled);
        assert!(!rule.deleted);
    }

    #[test]
    fn test_fingerprint_label_order_independent() {
        let id = Uuid::new_v4();
        let mut a = HashMap::new();
        a.insert("region".to_string(), "eu".to_string());
        a.insert("tier".to_string(), "db".to_string());

        let mut b = HashMap::new();
        b.insert("tier".to_string(), "db".to_string());
        b.insert("region".to_string(), "eu".to_string());

        assert_eq!(fingerprint(id, &a), fingerprint(id, &b));
    }

    #[test]
    fn test_fingerprint_differs_by_rule_and_labels() {
        let labels = HashMap::new();
        let fp1 = fingerprint(Uuid::new_v4(), &labels);
        let fp2 = fingerprint(Uuid::new_v4(), &labels);
        assert_ne!(fp1, fp2);

        let id = Uuid::new_v4();
        let mut labeled = HashMap::new();
        labeled.insert("a".to_string(), "1".to_string());
        assert_ne!(fingerprint(id, &HashMap::new()), fingerprint(id, &labeled));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint(Uuid::new_v4(), &HashMap::new());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
