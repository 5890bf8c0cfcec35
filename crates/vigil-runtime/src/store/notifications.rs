use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::channel::ChannelType;
use vigil_core::notification::Notification;
use vigil_core::{Result, VigilError};

/// Store for notification delivery records.
#[derive(Clone)]
pub struct NotificationStore {
    pool: sqlx::PgPool,
}

const NOTIFICATION_COLUMNS: &str =
    "id, alert_id, channel_id, channel_type, sent_at, retry_count, success, error";

impl NotificationStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Record a terminal delivery outcome.
    pub async fn create(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications
            (id, alert_id, channel_id, channel_type, sent_at, retry_count, success, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.id)
        .bind(&notification.alert_id)
        .bind(notification.channel_id)
        .bind(notification.channel_type.to_string())
        .bind(notification.sent_at)
        .bind(notification.retry_count as i32)
        .bind(notification.success)
        .bind(&notification.error)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(())
    }

    /// Delivery history for an alert, oldest first.
    pub async fn list_for_alert(&self, alert_id: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE alert_id = $1 ORDER BY sent_at ASC",
            NOTIFICATION_COLUMNS
        ))
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_notification_row).collect())
    }

    /// Recent deliveries through a channel, newest first.
    pub async fn list_for_channel(&self, channel_id: Uuid, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE channel_id = $1 ORDER BY sent_at DESC LIMIT $2",
            NOTIFICATION_COLUMNS
        ))
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_notification_row).collect())
    }
}

fn parse_notification_row(row: PgRow) -> Notification {
    let type_str: String = row.get("channel_type");
    let retry_count: i32 = row.get("retry_count");

    Notification {
        id: row.get("id"),
        alert_id: row.get("alert_id"),
        channel_id: row.get("channel_id"),
        channel_type: type_str.parse().unwrap_or(ChannelType::Webhook),
        sent_at: row.get("sent_at"),
        retry_count: retry_count.max(0) as u32,
        success: row.get("success"),
        error: row.get("error"),
    }
}
