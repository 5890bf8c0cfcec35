//! Notification channel implementations.

mod email;
mod sms;
mod webhook;

pub use email::EmailChannel;
pub use sms::SmsChannel;
pub use webhook::WebhookChannel;

use std::future::Future;
use std::pin::Pin;

use vigil_core::alert::Alert;
use vigil_core::channel::{Channel, ChannelType};
use vigil_core::rule::Severity;
use vigil_core::{Result, VigilError};

/// Boxed future alias for channel trait methods.
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A transport capable of delivering alerts.
///
/// Implementations are stateless with respect to individual channels: the
/// per-channel configuration arrives with every send.
pub trait NotificationChannel: Send + Sync {
    /// The channel type this implementation serves.
    fn channel_type(&self) -> ChannelType;

    /// Whether [`NotificationChannel::send_batch`] is supported.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Deliver one alert.
    fn send<'a>(&'a self, alert: &'a Alert, channel: &'a Channel) -> ChannelFuture<'a>;

    /// Deliver a batch in one call. Only valid when `supports_batch()`.
    fn send_batch<'a>(&'a self, alerts: &'a [Alert], channel: &'a Channel) -> ChannelFuture<'a> {
        let _ = (alerts, channel);
        Box::pin(async move {
            Err(VigilError::Channel(format!(
                "{} channels do not support batch sends",
                self.channel_type()
            )))
        })
    }
}

/// Display color for a severity, shared by webhook templates and email.
pub fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "#2eb886",
        Severity::Warning => "#daa038",
        Severity::Critical => "#a30200",
    }
}

/// Short status marker used in rendered notifications.
pub fn status_badge(alert: &Alert) -> &'static str {
    match alert.status {
        vigil_core::alert::AlertStatus::Active => "FIRING",
        vigil_core::alert::AlertStatus::Acknowledged => "ACKNOWLEDGED",
        vigil_core::alert::AlertStatus::Resolved => "RESOLVED",
    }
}
