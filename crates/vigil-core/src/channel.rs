use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::Alert;
use crate::error::{Result, VigilError};

/// Notification channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Webhook,
    Email,
    Sms,
    Slack,
    Discord,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Webhook => write!(f, "webhook"),
            ChannelType::Email => write!(f, "email"),
            ChannelType::Sms => write!(f, "sms"),
            ChannelType::Slack => write!(f, "slack"),
            ChannelType::Discord => write!(f, "discord"),
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "webhook" => Ok(ChannelType::Webhook),
            "email" => Ok(ChannelType::Email),
            "sms" => Ok(ChannelType::Sms),
            "slack" => Ok(ChannelType::Slack),
            "discord" => Ok(ChannelType::Discord),
            _ => Err(format!("Unknown channel type: {}", s)),
        }
    }
}

/// A configured notification channel.
///
/// Channels are stateless; `config` keys are interpreted per type (webhook:
/// `url`, `headers`, `template`; email: `to`, `format`; sms: `to`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub config: HashMap<String, serde_json::Value>,
    pub filters: Vec<ChannelFilter>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Create a channel with an empty config.
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            channel_type,
            config: HashMap::new(),
            filters: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set a config key.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Add a filter.
    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Fetch a required string config key.
    pub fn config_str(&self, key: &str) -> Result<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                VigilError::Validation(format!(
                    "channel '{}' is missing config key '{}'",
                    self.name, key
                ))
            })
    }

    /// Fetch an optional string config key.
    pub fn config_str_opt(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// True when every filter matches the alert (filters are ANDed).
    pub fn matches(&self, alert: &Alert) -> bool {
        self.filters.iter().all(|f| f.matches(alert))
    }
}

/// Filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    In,
    NotIn,
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterOp::Eq => write!(f, "eq"),
            FilterOp::Ne => write!(f, "ne"),
            FilterOp::In => write!(f, "in"),
            FilterOp::NotIn => write!(f, "not_in"),
        }
    }
}

impl std::str::FromStr for FilterOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eq" => Ok(FilterOp::Eq),
            "ne" => Ok(FilterOp::Ne),
            "in" => Ok(FilterOp::In),
            "not_in" | "notin" => Ok(FilterOp::NotIn),
            _ => Err(format!("Unknown filter operator: {}", s)),
        }
    }
}

/// A single per-channel delivery filter.
///
/// `field` is one of the built-ins (`severity`, `source`, `status`,
/// `rule_id`) or any alert label key. Set semantics are fixed: `in` with an
/// empty value list matches nothing; `not_in` with an empty value list
/// matches everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl ChannelFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            op,
            values,
        }
    }

    /// Evaluate the filter against an alert.
    pub fn matches(&self, alert: &Alert) -> bool {
        let actual = match self.field.as_str() {
            "severity" => Some(alert.severity.to_string()),
            "source" => Some(alert.source.clone()),
            "status" => Some(alert.status.to_string()),
            "rule_id" => Some(alert.rule_id.to_string()),
            label => alert.labels.get(label).cloned(),
        };

        let Some(actual) = actual else {
            // Absent label: only not_in can match.
            return self.op == FilterOp::NotIn;
        };

        match self.op {
            FilterOp::Eq => self.values.first().is_some_and(|v| *v == actual),
            FilterOp::Ne => self.values.first().is_none_or(|v| *v != actual),
            FilterOp::In => self.values.iter().any(|v| *v == actual),
            FilterOp::NotIn => !self.values.iter().any(|v| *v == actual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Rule, Severity, ThresholdOp};

    fn alert(severity: Severity) -> Alert {
        let rule = Rule::new("latency", "p99_latency_ms", ThresholdOp::Gt, 500.0)
            .with_severity(severity)
            .with_source("gateway")
            .with_label("region", "eu-west");
        Alert::firing(&rule, 720.0, Utc::now())
    }

    #[test]
    fn test_filter_eq_on_severity() {
        let f = ChannelFilter::new("severity", FilterOp::Eq, vec!["critical".to_string()]);
        assert!(f.matches(&alert(Severity::Critical)));
        assert!(!f.matches(&alert(Severity::Warning)));
    }

    #[test]
    fn test_filter_in_on_severity() {
        let f = ChannelFilter::new(
            "severity",
            FilterOp::In,
            vec!["warning".to_string(), "critical".to_string()],
        );
        assert!(f.matches(&alert(Severity::Warning)));
        assert!(!f.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_filter_in_empty_matches_nothing() {
        let f = ChannelFilter::new("severity", FilterOp::In, vec![]);
        assert!(!f.matches(&alert(Severity::Critical)));
        assert!(!f.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_filter_not_in_empty_matches_everything() {
        let f = ChannelFilter::new("severity", FilterOp::NotIn, vec![]);
        assert!(f.matches(&alert(Severity::Critical)));
        assert!(f.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_filter_on_label_key() {
        let f = ChannelFilter::new("region", FilterOp::Eq, vec!["eu-west".to_string()]);
        assert!(f.matches(&alert(Severity::Info)));

        let f = ChannelFilter::new("region", FilterOp::Ne, vec!["us-east".to_string()]);
        assert!(f.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_filter_on_absent_label() {
        let f = ChannelFilter::new("cluster", FilterOp::Eq, vec!["a".to_string()]);
        assert!(!f.matches(&alert(Severity::Info)));

        let f = ChannelFilter::new("cluster", FilterOp::NotIn, vec!["a".to_string()]);
        assert!(f.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_channel_filters_are_anded() {
        let channel = Channel::new("pager", ChannelType::Webhook)
            .with_filter(ChannelFilter::new(
                "severity",
                FilterOp::In,
                vec!["critical".to_string()],
            ))
            .with_filter(ChannelFilter::new(
                "source",
                FilterOp::Eq,
                vec!["gateway".to_string()],
            ));

        assert!(channel.matches(&alert(Severity::Critical)));
        assert!(!channel.matches(&alert(Severity::Warning)));
    }

    #[test]
    fn test_channel_without_filters_matches_all() {
        let channel = Channel::new("catch-all", ChannelType::Email);
        assert!(channel.matches(&alert(Severity::Info)));
    }

    #[test]
    fn test_config_str() {
        let channel = Channel::new("hook", ChannelType::Webhook)
            .with_config("url", serde_json::json!("https://example.com/hook"));

        assert_eq!(channel.config_str("url").unwrap(), "https://example.com/hook");
        assert!(channel.config_str("template").is_err());
        assert_eq!(channel.config_str_opt("template"), None);
    }

    #[test]
    fn test_channel_type_round_trip() {
        for t in ["webhook", "email", "sms", "slack", "discord"] {
            let parsed: ChannelType = t.parse().unwrap();
            assert_eq!(parsed.to_string(), t);
        }
        assert!("pigeon".parse::<ChannelType>().is_err());
    }
}
