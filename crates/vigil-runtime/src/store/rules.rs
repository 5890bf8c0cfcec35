use std::collections::HashMap;

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::rule::{Rule, Severity, ThresholdOp};
use vigil_core::{Result, VigilError};

/// Store for alert rules.
#[derive(Clone)]
pub struct RuleStore {
    pool: sqlx::PgPool,
}

const RULE_COLUMNS: &str = "id, name, description, expression, operator, threshold, severity, \
     source, for_duration_secs, interval_secs, labels, annotations, channels, enabled, deleted, \
     created_at, updated_at";

impl RuleStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Insert a rule.
    pub async fn create(&self, rule: &Rule) -> Result<()> {
        let labels = serde_json::to_value(&rule.labels).unwrap_or_default();
        let annotations = serde_json::to_value(&rule.annotations).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO rules
            (id, name, description, expression, operator, threshold, severity, source,
             for_duration_secs, interval_secs, labels, annotations, channels, enabled, deleted,
             created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.expression)
        .bind(rule.operator.to_string())
        .bind(rule.threshold)
        .bind(rule.severity.to_string())
        .bind(&rule.source)
        .bind(rule.for_duration_secs as i64)
        .bind(rule.interval_secs as i64)
        .bind(labels)
        .bind(annotations)
        .bind(&rule.channels)
        .bind(rule.enabled)
        .bind(rule.deleted)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(())
    }

    /// List all non-deleted rules.
    pub async fn list(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rules WHERE NOT deleted ORDER BY name",
            RULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_rule_row).collect())
    }

    /// List rules the engine should evaluate.
    pub async fn list_enabled(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rules WHERE enabled AND NOT deleted ORDER BY name",
            RULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_rule_row).collect())
    }

    /// Get a rule by id (deleted rules included, for historical alerts).
    pub async fn get(&self, id: Uuid) -> Result<Option<Rule>> {
        let row = sqlx::query(&format!("SELECT {} FROM rules WHERE id = $1", RULE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(row.map(parse_rule_row))
    }

    /// Update a rule in place.
    pub async fn update(&self, rule: &Rule) -> Result<()> {
        let labels = serde_json::to_value(&rule.labels).unwrap_or_default();
        let annotations = serde_json::to_value(&rule.annotations).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE rules
            SET name = $2, description = $3, expression = $4, operator = $5, threshold = $6,
                severity = $7, source = $8, for_duration_secs = $9, interval_secs = $10,
                labels = $11, annotations = $12, channels = $13, enabled = $14,
                updated_at = NOW()
            WHERE id = $1 AND NOT deleted
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.expression)
        .bind(rule.operator.to_string())
        .bind(rule.threshold)
        .bind(rule.severity.to_string())
        .bind(&rule.source)
        .bind(rule.for_duration_secs as i64)
        .bind(rule.interval_secs as i64)
        .bind(labels)
        .bind(annotations)
        .bind(&rule.channels)
        .bind(rule.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(VigilError::NotFound(format!("rule {}", rule.id)));
        }

        Ok(())
    }

    /// Soft-delete a rule; its alerts stay.
    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE rules SET deleted = TRUE, enabled = FALSE, updated_at = NOW() WHERE id = $1 AND NOT deleted",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(VigilError::NotFound(format!("rule {}", id)));
        }

        Ok(())
    }
}

fn parse_rule_row(row: PgRow) -> Rule {
    let labels_json: serde_json::Value = row.get("labels");
    let annotations_json: serde_json::Value = row.get("annotations");
    let labels: HashMap<String, String> = serde_json::from_value(labels_json).unwrap_or_default();
    let annotations: HashMap<String, String> =
        serde_json::from_value(annotations_json).unwrap_or_default();
    let operator_str: String = row.get("operator");
    let severity_str: String = row.get("severity");
    let for_duration: i64 = row.get("for_duration_secs");
    let interval: i64 = row.get("interval_secs");

    Rule {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        expression: row.get("expression"),
        operator: operator_str.parse().unwrap_or(ThresholdOp::Gt),
        threshold: row.get("threshold"),
        severity: severity_str.parse().unwrap_or(Severity::Warning),
        source: row.get("source"),
        for_duration_secs: for_duration.max(0) as u64,
        interval_secs: interval.max(0) as u64,
        labels,
        annotations,
        channels: row.get("channels"),
        enabled: row.get("enabled"),
        deleted: row.get("deleted"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rule_store_creation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");

        let _store = RuleStore::new(pool);
    }
}
