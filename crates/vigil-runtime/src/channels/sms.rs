use vigil_core::alert::Alert;
use vigil_core::channel::{Channel, ChannelType};
use vigil_core::config::SmsConfig;
use vigil_core::{Result, VigilError};

use super::{ChannelFuture, NotificationChannel};

/// Maximum characters in one SMS segment.
const SMS_MAX_LEN: usize = 160;

/// SMS delivery through a Twilio-compatible REST API.
pub struct SmsChannel {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsChannel {
    pub fn new(client: reqwest::Client, config: SmsConfig) -> Result<Self> {
        if config.api_url.is_empty() || config.account_sid.is_empty() {
            return Err(VigilError::Config(
                "sms.api_url and sms.account_sid are required for SMS channels".to_string(),
            ));
        }
        Ok(Self { client, config })
    }

    fn message_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

impl NotificationChannel for SmsChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }

    fn send<'a>(&'a self, alert: &'a Alert, channel: &'a Channel) -> ChannelFuture<'a> {
        Box::pin(async move {
            let to = channel.config_str("to")?;
            let body = truncate(&render_sms(alert), SMS_MAX_LEN);

            let response = self
                .client
                .post(self.message_url())
                .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
                .form(&[
                    ("To", to),
                    ("From", self.config.from_number.as_str()),
                    ("Body", body.as_str()),
                ])
                .send()
                .await
                .map_err(|e| VigilError::Channel(format!("SMS request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(VigilError::Channel(format!("SMS API returned HTTP {}", status)));
            }

            Ok(())
        })
    }
}

fn render_sms(alert: &Alert) -> String {
    format!(
        "[{}] {}: {} (value {}, threshold {})",
        alert.severity.to_string().to_uppercase(),
        alert.source,
        alert.rule_name,
        alert.value,
        alert.threshold
    )
}

/// Truncate on a char boundary.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::rule::{Rule, Severity, ThresholdOp};

    fn config() -> SmsConfig {
        SmsConfig {
            api_url: "https://api.twilio.com".to_string(),
            account_sid: "AC123".to_string(),
            auth_token: "token".to_string(),
            from_number: "+15550100".to_string(),
        }
    }

    #[test]
    fn test_new_requires_api_config() {
        assert!(SmsChannel::new(reqwest::Client::new(), config()).is_ok());

        let mut missing = config();
        missing.account_sid = String::new();
        assert!(matches!(
            SmsChannel::new(reqwest::Client::new(), missing),
            Err(VigilError::Config(_))
        ));
    }

    #[test]
    fn test_message_url() {
        let channel = SmsChannel::new(reqwest::Client::new(), config()).unwrap();
        assert_eq!(
            channel.message_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn test_render_sms() {
        let rule = Rule::new("cpu_high", "cpu", ThresholdOp::Gt, 90.0)
            .with_severity(Severity::Critical)
            .with_source("node-1");
        let alert = Alert::firing(&rule, 97.0, Utc::now());

        let text = render_sms(&alert);
        assert!(text.starts_with("[CRITICAL] node-1: cpu_high"));
        assert!(text.contains("value 97"));
    }

    #[test]
    fn test_truncation_to_160_chars() {
        let long = "x".repeat(500);
        let truncated = truncate(&long, SMS_MAX_LEN);
        assert_eq!(truncated.chars().count(), 160);

        let short = "short message";
        assert_eq!(truncate(short, SMS_MAX_LEN), short);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let s = "é".repeat(200);
        let truncated = truncate(&s, SMS_MAX_LEN);
        assert_eq!(truncated.chars().count(), 160);
    }
}
