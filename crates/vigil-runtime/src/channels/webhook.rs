use std::collections::HashMap;

use serde_json::json;

use vigil_core::alert::Alert;
use vigil_core::channel::{Channel, ChannelType};
use vigil_core::config::WebhookConfig;
use vigil_core::{Result, VigilError};

use super::{severity_color, status_badge, ChannelFuture, NotificationChannel};

/// Payload shapes a webhook channel can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookTemplate {
    #[default]
    Generic,
    Pagerduty,
    Slack,
    Discord,
}

impl std::str::FromStr for WebhookTemplate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "pagerduty" => Ok(Self::Pagerduty),
            "slack" => Ok(Self::Slack),
            "discord" => Ok(Self::Discord),
            _ => Err(format!("Unknown webhook template: {}", s)),
        }
    }
}

/// Webhook delivery over HTTP POST. Slack and Discord channels are webhook
/// channels with a forced template.
pub struct WebhookChannel {
    client: reqwest::Client,
    defaults: WebhookConfig,
    channel_type: ChannelType,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, defaults: WebhookConfig) -> Self {
        Self {
            client,
            defaults,
            channel_type: ChannelType::Webhook,
        }
    }

    /// A webhook transport registered under the slack or discord type.
    pub fn for_type(client: reqwest::Client, defaults: WebhookConfig, ty: ChannelType) -> Self {
        Self {
            client,
            defaults,
            channel_type: ty,
        }
    }

    fn template(&self, channel: &Channel) -> Result<WebhookTemplate> {
        match self.channel_type {
            ChannelType::Slack => Ok(WebhookTemplate::Slack),
            ChannelType::Discord => Ok(WebhookTemplate::Discord),
            _ => match channel.config_str_opt("template") {
                None => Ok(WebhookTemplate::Generic),
                Some(raw) => raw.parse().map_err(VigilError::Validation),
            },
        }
    }

    fn headers(&self, channel: &Channel) -> HashMap<String, String> {
        let mut headers = self.defaults.default_headers.clone();
        if let Some(extra) = channel.config.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in extra {
                if let Some(value) = v.as_str() {
                    headers.insert(k.clone(), value.to_string());
                }
            }
        }
        headers
    }

    async fn post(&self, channel: &Channel, payload: serde_json::Value) -> Result<()> {
        let url = channel.config_str("url")?;

        let mut request = self.client.post(url).json(&payload);
        for (name, value) in self.headers(channel) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VigilError::Channel(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VigilError::Channel(format!(
                "webhook returned HTTP {}",
                status
            )));
        }

        Ok(())
    }
}

impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn send<'a>(&'a self, alert: &'a Alert, channel: &'a Channel) -> ChannelFuture<'a> {
        Box::pin(async move {
            let template = self.template(channel)?;
            let payload = render_alert(alert, template);
            self.post(channel, payload).await
        })
    }

    fn send_batch<'a>(&'a self, alerts: &'a [Alert], channel: &'a Channel) -> ChannelFuture<'a> {
        Box::pin(async move {
            let template = self.template(channel)?;
            let payload = render_batch(alerts, template);
            self.post(channel, payload).await
        })
    }
}

/// Render one alert for a template.
fn render_alert(alert: &Alert, template: WebhookTemplate) -> serde_json::Value {
    match template {
        WebhookTemplate::Generic => json!({
            "id": alert.id,
            "rule_id": alert.rule_id,
            "rule_name": alert.rule_name,
            "source": alert.source,
            "severity": alert.severity,
            "status": alert.status,
            "message": alert.message,
            "value": alert.value,
            "threshold": alert.threshold,
            "labels": alert.labels,
            "annotations": alert.annotations,
            "created_at": alert.created_at,
        }),
        WebhookTemplate::Pagerduty => json!({
            "event_action": "trigger",
            "dedup_key": alert.fingerprint,
            "payload": {
                "summary": alert.message,
                "source": alert.source,
                "severity": alert.severity,
                "custom_details": {
                    "rule": alert.rule_name,
                    "value": alert.value,
                    "threshold": alert.threshold,
                    "labels": alert.labels,
                },
            },
        }),
        WebhookTemplate::Slack => json!({
            "text": format!("[{}] {}", status_badge(alert), alert.message),
            "attachments": [{
                "color": severity_color(alert.severity),
                "fields": [
                    {"title": "Rule", "value": alert.rule_name, "short": true},
                    {"title": "Severity", "value": alert.severity.to_string(), "short": true},
                    {"title": "Source", "value": alert.source, "short": true},
                    {"title": "Value", "value": alert.value.to_string(), "short": true},
                ],
            }],
        }),
        WebhookTemplate::Discord => json!({
            "content": format!("[{}] {}", status_badge(alert), alert.rule_name),
            "embeds": [{
                "title": alert.rule_name,
                "description": alert.message,
                "color": discord_color(severity_color(alert.severity)),
            }],
        }),
    }
}

/// Render a batch for a template.
fn render_batch(alerts: &[Alert], template: WebhookTemplate) -> serde_json::Value {
    match template {
        WebhookTemplate::Slack => json!({
            "text": format!("{} alerts", alerts.len()),
            "attachments": alerts
                .iter()
                .map(|a| json!({
                    "color": severity_color(a.severity),
                    "text": format!("[{}] {}", status_badge(a), a.message),
                }))
                .collect::<Vec<_>>(),
        }),
        WebhookTemplate::Discord => json!({
            "content": format!("{} alerts", alerts.len()),
            "embeds": alerts
                .iter()
                .take(10)
                .map(|a| json!({
                    "title": a.rule_name,
                    "description": a.message,
                    "color": discord_color(severity_color(a.severity)),
                }))
                .collect::<Vec<_>>(),
        }),
        _ => json!({
            "count": alerts.len(),
            "alerts": alerts
                .iter()
                .map(|a| render_alert(a, WebhookTemplate::Generic))
                .collect::<Vec<_>>(),
        }),
    }
}

/// Discord embeds take colors as decimal integers.
fn discord_color(hex: &str) -> u32 {
    u32::from_str_radix(hex.trim_start_matches('#'), 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::rule::{Rule, Severity, ThresholdOp};

    fn alert() -> Alert {
        let rule = Rule::new("api_errors", "error_rate", ThresholdOp::Gt, 0.05)
            .with_severity(Severity::Critical)
            .with_source("api");
        Alert::firing(&rule, 0.12, Utc::now())
    }

    #[test]
    fn test_template_parsing() {
        assert_eq!(
            "pagerduty".parse::<WebhookTemplate>().unwrap(),
            WebhookTemplate::Pagerduty
        );
        assert!("teams".parse::<WebhookTemplate>().is_err());
    }

    #[test]
    fn test_generic_payload_carries_core_fields() {
        let payload = render_alert(&alert(), WebhookTemplate::Generic);
        assert_eq!(payload["rule_name"], "api_errors");
        assert_eq!(payload["severity"], "critical");
        assert_eq!(payload["value"], 0.12);
    }

    #[test]
    fn test_pagerduty_payload_shape() {
        let a = alert();
        let payload = render_alert(&a, WebhookTemplate::Pagerduty);
        assert_eq!(payload["event_action"], "trigger");
        assert_eq!(payload["dedup_key"], a.fingerprint.as_str());
        assert_eq!(payload["payload"]["severity"], "critical");
    }

    #[test]
    fn test_slack_payload_uses_severity_color() {
        let payload = render_alert(&alert(), WebhookTemplate::Slack);
        assert_eq!(
            payload["attachments"][0]["color"],
            severity_color(Severity::Critical)
        );
        assert!(payload["text"].as_str().unwrap().contains("FIRING"));
    }

    #[test]
    fn test_discord_color_conversion() {
        assert_eq!(discord_color("#a30200"), 0xa30200);
        assert_eq!(discord_color("#2eb886"), 0x2eb886);
    }

    #[test]
    fn test_batch_payload_counts() {
        let alerts = vec![alert(), alert(), alert()];
        let payload = render_batch(&alerts, WebhookTemplate::Generic);
        assert_eq!(payload["count"], 3);
        assert_eq!(payload["alerts"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_slack_channel_forces_template() {
        let webhook = WebhookChannel::for_type(
            reqwest::Client::new(),
            WebhookConfig::default(),
            ChannelType::Slack,
        );
        // Even with a generic template configured, the slack type wins.
        let channel = Channel::new("s", ChannelType::Slack)
            .with_config("template", serde_json::json!("generic"));
        assert_eq!(webhook.template(&channel).unwrap(), WebhookTemplate::Slack);
    }

    #[test]
    fn test_headers_merge_channel_over_defaults() {
        let mut defaults = WebhookConfig::default();
        defaults
            .default_headers
            .insert("x-env".to_string(), "prod".to_string());

        let webhook = WebhookChannel::new(reqwest::Client::new(), defaults);
        let channel = Channel::new("w", ChannelType::Webhook)
            .with_config("headers", serde_json::json!({"x-token": "abc"}));

        let headers = webhook.headers(&channel);
        assert_eq!(headers.get("x-env").map(String::as_str), Some("prod"));
        assert_eq!(headers.get("x-token").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_missing_url_is_validation_error() {
        let channel = Channel::new("w", ChannelType::Webhook);
        assert!(matches!(
            channel.config_str("url"),
            Err(VigilError::Validation(_))
        ));
    }
}
