use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use vigil_core::alert::Alert;
use vigil_core::channel::{Channel, ChannelType};
use vigil_core::config::{SmtpConfig, SmtpSecurity};
use vigil_core::{Result, VigilError};

use super::{severity_color, status_badge, ChannelFuture, NotificationChannel};

/// Email delivery over SMTP.
///
/// The transport comes from process config; the recipient list and format
/// come from the channel (`to` as a comma-separated list, `format` html or
/// text).
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    /// Build the channel from SMTP config. Fails on a malformed host or
    /// from address (fatal config class).
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(VigilError::Config("smtp.host is required for email channels".to_string()));
        }

        let mut builder = match config.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| VigilError::Config(format!("invalid SMTP relay: {}", e)))?,
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(|e| VigilError::Config(format!("invalid SMTP relay: {}", e)))?
            }
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        builder = builder.port(config.port);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| VigilError::Config(format!("invalid smtp.from_address: {}", e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn recipients(channel: &Channel) -> Result<Vec<Mailbox>> {
        let raw = channel.config_str("to")?;
        let mut recipients = Vec::new();

        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            recipients.push(part.parse::<Mailbox>().map_err(|e| {
                VigilError::Validation(format!("invalid recipient '{}': {}", part, e))
            })?);
        }

        if recipients.is_empty() {
            return Err(VigilError::Validation(format!(
                "channel '{}' has no recipients",
                channel.name
            )));
        }

        Ok(recipients)
    }

    async fn deliver(&self, channel: &Channel, subject: String, alert: &Alert) -> Result<()> {
        let html = channel.config_str_opt("format").map(|f| f.eq_ignore_ascii_case("html"))
            .unwrap_or(true);

        let (content_type, body) = if html {
            (ContentType::TEXT_HTML, render_html(alert))
        } else {
            (ContentType::TEXT_PLAIN, render_text(alert))
        };

        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in Self::recipients(channel)? {
            builder = builder.to(recipient);
        }

        let message = builder
            .header(content_type)
            .body(body)
            .map_err(|e| VigilError::Channel(format!("failed to build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| VigilError::Channel(format!("SMTP send failed: {}", e)))?;

        Ok(())
    }
}

impl NotificationChannel for EmailChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn send<'a>(&'a self, alert: &'a Alert, channel: &'a Channel) -> ChannelFuture<'a> {
        Box::pin(async move {
            let subject = format!("[{}] {}", alert.severity.to_string().to_uppercase(), alert.rule_name);
            self.deliver(channel, subject, alert).await
        })
    }
}

/// HTML body template. Parameters: the alert, its severity color, and the
/// status badge; the template text itself is fixed at compile time.
fn render_html(alert: &Alert) -> String {
    let labels: String = alert
        .labels
        .iter()
        .map(|(k, v)| format!("<tr><td>{}</td><td>{}</td></tr>", escape(k), escape(v)))
        .collect();

    format!(
        r#"<html><body>
<div style="border-left: 4px solid {color}; padding: 8px 16px;">
  <h2 style="margin: 0;">{badge}: {rule}</h2>
  <p>{message}</p>
  <table>
    <tr><td>Severity</td><td style="color: {color};">{severity}</td></tr>
    <tr><td>Source</td><td>{source}</td></tr>
    <tr><td>Value</td><td>{value}</td></tr>
    <tr><td>Threshold</td><td>{threshold}</td></tr>
    {labels}
  </table>
</div>
</body></html>"#,
        color = severity_color(alert.severity),
        badge = status_badge(alert),
        rule = escape(&alert.rule_name),
        message = escape(&alert.message),
        severity = alert.severity,
        source = escape(&alert.source),
        value = alert.value,
        threshold = alert.threshold,
        labels = labels,
    )
}

/// Plain-text body template.
fn render_text(alert: &Alert) -> String {
    let mut body = format!(
        "{badge}: {rule}\n\n{message}\n\nSeverity:  {severity}\nSource:    {source}\nValue:     {value}\nThreshold: {threshold}\n",
        badge = status_badge(alert),
        rule = alert.rule_name,
        message = alert.message,
        severity = alert.severity,
        source = alert.source,
        value = alert.value,
        threshold = alert.threshold,
    );

    if !alert.labels.is_empty() {
        body.push_str("\nLabels:\n");
        let mut keys: Vec<_> = alert.labels.keys().collect();
        keys.sort();
        for key in keys {
            body.push_str(&format!("  {} = {}\n", key, alert.labels[key]));
        }
    }

    body
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::rule::{Rule, Severity, ThresholdOp};

    fn alert() -> Alert {
        let rule = Rule::new("disk_full", "disk_used", ThresholdOp::Gt, 95.0)
            .with_severity(Severity::Critical)
            .with_source("storage")
            .with_label("mount", "/data");
        Alert::firing(&rule, 97.0, Utc::now())
    }

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "vigil".to_string(),
            password: "secret".to_string(),
            from_address: "alerts@example.com".to_string(),
            security: SmtpSecurity::Starttls,
        }
    }

    #[tokio::test]
    async fn test_from_config_builds_transport() {
        assert!(EmailChannel::from_config(&smtp_config()).is_ok());

        let mut plain = smtp_config();
        plain.security = SmtpSecurity::None;
        assert!(EmailChannel::from_config(&plain).is_ok());

        let mut tls = smtp_config();
        tls.security = SmtpSecurity::Tls;
        assert!(EmailChannel::from_config(&tls).is_ok());
    }

    #[test]
    fn test_from_config_requires_host() {
        let mut config = smtp_config();
        config.host = String::new();
        assert!(matches!(
            EmailChannel::from_config(&config),
            Err(VigilError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_bad_from() {
        let mut config = smtp_config();
        config.from_address = "not an address".to_string();
        assert!(matches!(
            EmailChannel::from_config(&config),
            Err(VigilError::Config(_))
        ));
    }

    #[test]
    fn test_recipient_parsing() {
        let channel = Channel::new("ops", ChannelType::Email)
            .with_config("to", serde_json::json!("a@example.com, b@example.com"));

        let recipients = EmailChannel::recipients(&channel).unwrap();
        assert_eq!(recipients.len(), 2);
    }

    #[test]
    fn test_recipient_parsing_rejects_garbage() {
        let channel = Channel::new("ops", ChannelType::Email)
            .with_config("to", serde_json::json!("not an address"));
        assert!(EmailChannel::recipients(&channel).is_err());

        let empty = Channel::new("ops", ChannelType::Email)
            .with_config("to", serde_json::json!(""));
        assert!(EmailChannel::recipients(&empty).is_err());
    }

    #[test]
    fn test_html_rendering() {
        let body = render_html(&alert());
        assert!(body.contains("FIRING"));
        assert!(body.contains("disk_full"));
        assert!(body.contains(severity_color(Severity::Critical)));
        assert!(body.contains("/data"));
    }

    #[test]
    fn test_html_escapes_content() {
        let mut a = alert();
        a.message = "<script>alert(1)</script>".to_string();
        let body = render_html(&a);
        assert!(!body.contains("<script>"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_text_rendering() {
        let body = render_text(&alert());
        assert!(body.contains("FIRING: disk_full"));
        assert!(body.contains("Severity:  critical"));
        assert!(body.contains("mount = /data"));
    }
}
