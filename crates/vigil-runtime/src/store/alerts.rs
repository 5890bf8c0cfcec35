use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::alert::{Alert, AlertStatus};
use vigil_core::rule::Severity;
use vigil_core::{Result, VigilError};

/// Store for alerts.
#[derive(Clone)]
pub struct AlertStore {
    pool: sqlx::PgPool,
}

const ALERT_COLUMNS: &str = "id, rule_id, rule_name, source, severity, status, message, \
     description, value, threshold, fingerprint, labels, annotations, metadata, created_at, \
     updated_at, resolved_at, acknowledged_by";

/// Filters for alert listings.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub rule_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AlertStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Insert an alert.
    pub async fn create(&self, alert: &Alert) -> Result<()> {
        let labels = serde_json::to_value(&alert.labels).unwrap_or_default();
        let annotations = serde_json::to_value(&alert.annotations).unwrap_or_default();
        let metadata = serde_json::to_value(&alert.metadata).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO alerts
            (id, rule_id, rule_name, source, severity, status, message, description, value,
             threshold, fingerprint, labels, annotations, metadata, created_at, updated_at,
             resolved_at, acknowledged_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(alert.id)
        .bind(alert.rule_id)
        .bind(&alert.rule_name)
        .bind(&alert.source)
        .bind(alert.severity.to_string())
        .bind(alert.status.to_string())
        .bind(&alert.message)
        .bind(&alert.description)
        .bind(alert.value)
        .bind(alert.threshold)
        .bind(&alert.fingerprint)
        .bind(labels)
        .bind(annotations)
        .bind(metadata)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .bind(alert.resolved_at)
        .bind(&alert.acknowledged_by)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(())
    }

    /// Get an alert by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query(&format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(row.map(parse_alert_row))
    }

    /// List alerts newest first, honoring the filter.
    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let sql = format!(
            "SELECT {} FROM alerts \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR severity = $2) \
               AND ($3::uuid IS NULL OR rule_id = $3) \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5",
            ALERT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.to_string()))
            .bind(filter.severity.map(|s| s.to_string()))
            .bind(filter.rule_id)
            .bind(filter.limit.unwrap_or(100).clamp(1, 1000))
            .bind(filter.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_alert_row).collect())
    }

    /// Find the unresolved alert carrying a fingerprint, if any. At most one
    /// exists at a time (fingerprint uniqueness among open alerts).
    pub async fn find_open_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Alert>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM alerts WHERE fingerprint = $1 AND status != 'resolved' \
             ORDER BY created_at DESC LIMIT 1",
            ALERT_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(row.map(parse_alert_row))
    }

    /// Refresh the observed value on an open alert.
    pub async fn refresh_value(&self, id: Uuid, value: f64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE alerts SET value = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(value)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(())
    }

    /// Resolve an alert. A no-op on already-resolved rows; returns the row
    /// either way.
    pub async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Alert>> {
        sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'resolved', resolved_at = $2, updated_at = $2
            WHERE id = $1 AND status != 'resolved'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        self.get(id).await
    }

    /// Acknowledge an alert. Only active alerts change; the current row is
    /// returned regardless.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'acknowledged', acknowledged_by = $2, updated_at = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(by)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        self.get(id).await
    }

    /// Delete resolved alerts older than the cutoff; returns how many went.
    pub async fn prune_resolved(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM alerts WHERE status = 'resolved' AND resolved_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Open alerts for a rule, used to rebuild engine state after restart.
    pub async fn list_open_for_rule(&self, rule_id: Uuid) -> Result<Vec<Alert>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM alerts WHERE rule_id = $1 AND status != 'resolved' \
             ORDER BY created_at DESC",
            ALERT_COLUMNS
        ))
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_alert_row).collect())
    }
}

fn parse_alert_row(row: PgRow) -> Alert {
    let labels_json: serde_json::Value = row.get("labels");
    let annotations_json: serde_json::Value = row.get("annotations");
    let metadata_json: serde_json::Value = row.get("metadata");
    let labels: HashMap<String, String> = serde_json::from_value(labels_json).unwrap_or_default();
    let annotations: HashMap<String, String> =
        serde_json::from_value(annotations_json).unwrap_or_default();
    let metadata: HashMap<String, String> =
        serde_json::from_value(metadata_json).unwrap_or_default();
    let severity_str: String = row.get("severity");
    let status_str: String = row.get("status");

    Alert {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        rule_name: row.get("rule_name"),
        source: row.get("source"),
        severity: severity_str.parse().unwrap_or(Severity::Warning),
        status: status_str.parse().unwrap_or(AlertStatus::Active),
        message: row.get("message"),
        description: row.get("description"),
        value: row.get("value"),
        threshold: row.get("threshold"),
        fingerprint: row.get("fingerprint"),
        labels,
        annotations,
        metadata,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        resolved_at: row.get("resolved_at"),
        acknowledged_by: row.get("acknowledged_by"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_filter_default() {
        let filter = AlertFilter::default();
        assert!(filter.status.is_none());
        assert!(filter.severity.is_none());
        assert!(filter.rule_id.is_none());
    }

    #[tokio::test]
    async fn test_alert_store_creation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");

        let _store = AlertStore::new(pool);
    }
}
