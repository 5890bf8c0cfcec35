use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelType;

/// One terminal delivery outcome for an (alert, channel) pair.
///
/// A row is written per terminal success or per terminal failure after
/// retries are exhausted; intermediate failures collapse into `error`.
/// Batch sends use the `batch-<count>` convention in `alert_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Alert id, or `batch-<count>` for batched deliveries.
    pub alert_id: String,
    pub channel_id: Uuid,
    pub channel_type: ChannelType,
    pub sent_at: DateTime<Utc>,
    /// Retries consumed before the terminal outcome (0 = first attempt).
    pub retry_count: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl Notification {
    /// Record a successful delivery.
    pub fn success(
        alert_id: impl Into<String>,
        channel_id: Uuid,
        channel_type: ChannelType,
        retry_count: u32,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id: alert_id.into(),
            channel_id,
            channel_type,
            sent_at,
            retry_count,
            success: true,
            error: None,
        }
    }

    /// Record a terminal failure.
    pub fn failure(
        alert_id: impl Into<String>,
        channel_id: Uuid,
        channel_type: ChannelType,
        retry_count: u32,
        error: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id: alert_id.into(),
            channel_id,
            channel_type,
            sent_at,
            retry_count,
            success: false,
            error: Some(error.into()),
        }
    }

    /// Alert id for a batch of the given size.
    pub fn batch_alert_id(count: usize) -> String {
        format!("batch-{}", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_row() {
        let n = Notification::success(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            ChannelType::Webhook,
            0,
            Utc::now(),
        );
        assert!(n.success);
        assert!(n.error.is_none());
        assert_eq!(n.retry_count, 0);
    }

    #[test]
    fn test_failure_row() {
        let n = Notification::failure(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            ChannelType::Sms,
            3,
            "HTTP 500",
            Utc::now(),
        );
        assert!(!n.success);
        assert_eq!(n.error.as_deref(), Some("HTTP 500"));
        assert_eq!(n.retry_count, 3);
    }

    #[test]
    fn test_batch_alert_id() {
        assert_eq!(Notification::batch_alert_id(7), "batch-7");
    }
}
