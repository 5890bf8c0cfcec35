use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::audit::{
    AuditActor, AuditEntry, AuditEvent, AuditEventType, AuditResult, GENESIS_HASH,
};
use vigil_core::rule::Severity;
use vigil_core::{Result, SharedClock, VigilError};

use super::verify::{verify_chain, ChainReport, TamperFinding};

/// Advisory lock id serializing appenders across processes.
const AUDIT_APPEND_LOCK_ID: i64 = 0x415544495431;

const AUDIT_COLUMNS: &str = "id, timestamp, event_type, user_id, user_email, user_role, action, \
     resource, resource_id, previous_value, new_value, changes, ip_address, user_agent, \
     session_id, result, severity, error_message, metadata, hash, previous_hash";

/// Query filters over the ledger.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub user_email: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub result: Option<AuditResult>,
    pub severity: Option<Severity>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Case-insensitive substring over action, resource, and error message.
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    /// Also search the archive table.
    pub include_archived: bool,
}

impl AuditQuery {
    /// (column, direction) with whitelisted sort keys only.
    fn sort(&self) -> (&'static str, &'static str) {
        let column = match self.sort_by.as_deref() {
            Some("event_type") => "event_type",
            Some("severity") => "severity",
            Some("user_email") => "user_email",
            Some("result") => "result",
            _ => "timestamp",
        };
        let direction = match self.sort_order.as_deref() {
            Some("asc") | Some("ASC") => "ASC",
            _ => "DESC",
        };
        (column, direction)
    }
}

/// Aggregate statistics over a time range.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditStats {
    pub total: i64,
    pub by_event_type: HashMap<String, i64>,
    pub by_result: HashMap<String, i64>,
    pub by_severity: HashMap<String, i64>,
    pub top_users: Vec<(String, i64)>,
    pub top_actions: Vec<(String, i64)>,
    pub success_rate: f64,
}

/// Append-only hash-chained audit ledger.
///
/// Appends are strictly serialized: a process-local mutex plus a
/// transaction-scoped advisory lock give a total order by (timestamp, id)
/// even with concurrent appenders.
pub struct AuditLedger {
    pool: sqlx::PgPool,
    clock: SharedClock,
    append_lock: tokio::sync::Mutex<()>,
}

impl AuditLedger {
    pub fn new(pool: sqlx::PgPool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Append an event, chaining it onto the most recent entry.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let _guard = self.append_lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_APPEND_LOCK_ID)
            .execute(&mut *tx)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        let head: Option<(Vec<u8>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT hash, timestamp FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        let (previous_hash, head_timestamp) = match head {
            Some((hash, ts)) => (to_hash(&hash), Some(ts)),
            None => (GENESIS_HASH, None),
        };

        // Monotonic timestamps even under clock skew: never step behind the
        // current head.
        let mut timestamp = self.clock.now();
        if let Some(head_ts) = head_timestamp {
            if timestamp <= head_ts {
                timestamp = head_ts + Duration::nanoseconds(1);
            }
        }

        let entry = AuditEntry::from_event(event, Uuid::new_v4(), timestamp, previous_hash);

        let changes = serde_json::to_value(&entry.changes).unwrap_or_default();
        let metadata = serde_json::to_value(&entry.metadata).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO audit_log
            (id, timestamp, event_type, user_id, user_email, user_role, action, resource,
             resource_id, previous_value, new_value, changes, ip_address, user_agent, session_id,
             result, severity, error_message, metadata, hash, previous_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            "#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(entry.event_type.as_str())
        .bind(&entry.actor.user_id)
        .bind(&entry.actor.user_email)
        .bind(&entry.actor.user_role)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.resource_id)
        .bind(&entry.previous_value)
        .bind(&entry.new_value)
        .bind(changes)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.session_id)
        .bind(entry.result.to_string())
        .bind(entry.severity.to_string())
        .bind(&entry.error_message)
        .bind(metadata)
        .bind(&entry.hash[..])
        .bind(&entry.previous_hash[..])
        .execute(&mut *tx)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        tracing::debug!(
            event_type = entry.event_type.as_str(),
            actor = %entry.actor.user_email,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Get an entry by id, consulting the archive as a fallback.
    pub async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>> {
        for table in ["audit_log", "audit_log_archive"] {
            let row = sqlx::query(&format!(
                "SELECT {} FROM {} WHERE id = $1",
                AUDIT_COLUMNS, table
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

            if let Some(row) = row {
                return Ok(Some(parse_audit_row(row)));
            }
        }
        Ok(None)
    }

    /// Query entries with filters, pagination, and sorting.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let (sort_column, sort_direction) = query.sort();

        let conditions = "($1::text IS NULL OR event_type = $1) \
             AND ($2::text IS NULL OR user_email = $2) \
             AND ($3::text IS NULL OR action = $3) \
             AND ($4::text IS NULL OR resource = $4) \
             AND ($5::text IS NULL OR result = $5) \
             AND ($6::text IS NULL OR severity = $6) \
             AND ($7::timestamptz IS NULL OR timestamp >= $7) \
             AND ($8::timestamptz IS NULL OR timestamp <= $8) \
             AND ($9::text IS NULL OR action ILIKE '%' || $9 || '%' \
                  OR resource ILIKE '%' || $9 || '%' \
                  OR COALESCE(error_message, '') ILIKE '%' || $9 || '%')";

        let sql = if query.include_archived {
            format!(
                "SELECT {cols} FROM audit_log WHERE {cond} \
                 UNION ALL \
                 SELECT {cols} FROM audit_log_archive WHERE {cond} \
                 ORDER BY {sort} {dir} LIMIT $10 OFFSET $11",
                cols = AUDIT_COLUMNS,
                cond = conditions,
                sort = sort_column,
                dir = sort_direction,
            )
        } else {
            format!(
                "SELECT {cols} FROM audit_log WHERE {cond} \
                 ORDER BY {sort} {dir} LIMIT $10 OFFSET $11",
                cols = AUDIT_COLUMNS,
                cond = conditions,
                sort = sort_column,
                dir = sort_direction,
            )
        };

        let rows = sqlx::query(&sql)
            .bind(query.event_type.map(|t| t.as_str().to_string()))
            .bind(&query.user_email)
            .bind(&query.action)
            .bind(&query.resource)
            .bind(query.result.map(|r| r.to_string()))
            .bind(query.severity.map(|s| s.to_string()))
            .bind(query.start_time)
            .bind(query.end_time)
            .bind(&query.search)
            .bind(query.limit.unwrap_or(100).clamp(1, 1000))
            .bind(query.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_audit_row).collect())
    }

    /// Chronological view, newest first.
    pub async fn timeline(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>> {
        let query = AuditQuery {
            start_time,
            end_time,
            limit: Some(limit),
            ..Default::default()
        };
        self.query(&query).await
    }

    /// Counts and rates over the active (non-archived) ledger.
    pub async fn statistics(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<AuditStats> {
        let by_event_type = self.grouped_counts("event_type", start_time, end_time).await?;
        let by_result = self.grouped_counts("result", start_time, end_time).await?;
        let by_severity = self.grouped_counts("severity", start_time, end_time).await?;
        let top_users = self.top_counts("user_email", 10, start_time, end_time).await?;
        let top_actions = self.top_counts("action", 10, start_time, end_time).await?;

        let total: i64 = by_result.values().sum();
        let successes = by_result.get("success").copied().unwrap_or(0);
        let success_rate = if total > 0 {
            successes as f64 / total as f64
        } else {
            0.0
        };

        Ok(AuditStats {
            total,
            by_event_type,
            by_result,
            by_severity,
            top_users,
            top_actions,
            success_rate,
        })
    }

    async fn grouped_counts(
        &self,
        column: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT {col}, COUNT(*) FROM audit_log \
             WHERE ($1::timestamptz IS NULL OR timestamp >= $1) \
               AND ($2::timestamptz IS NULL OR timestamp <= $2) \
             GROUP BY {col}",
            col = column
        );

        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(start_time)
            .bind(end_time)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().collect())
    }

    async fn top_counts(
        &self,
        column: &str,
        limit: i64,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT {col}, COUNT(*) AS n FROM audit_log \
             WHERE ($1::timestamptz IS NULL OR timestamp >= $1) \
               AND ($2::timestamptz IS NULL OR timestamp <= $2) \
             GROUP BY {col} ORDER BY n DESC LIMIT $3",
            col = column
        );

        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(start_time)
            .bind(end_time)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows)
    }

    /// Verify the chain over a time range.
    pub async fn verify_chain(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<ChainReport> {
        let (entries, preceding) = self.chain_range(start_time, end_time).await?;
        Ok(verify_chain(&entries, preceding.as_ref()))
    }

    /// Tamper findings over a time range.
    pub async fn detect_tampering(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<TamperFinding>> {
        let (entries, preceding) = self.chain_range(start_time, end_time).await?;
        Ok(verify_chain(&entries, preceding.as_ref()).findings)
    }

    async fn chain_range(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(Vec<AuditEntry>, Option<AuditEntry>)> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_log \
             WHERE ($1::timestamptz IS NULL OR timestamp >= $1) \
               AND ($2::timestamptz IS NULL OR timestamp <= $2) \
             ORDER BY timestamp ASC, id ASC",
            AUDIT_COLUMNS
        ))
        .bind(start_time)
        .bind(end_time)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        let entries: Vec<AuditEntry> = rows.into_iter().map(parse_audit_row).collect();

        // Anchor a mid-ledger range on the entry just before it.
        let preceding = match (start_time, entries.first()) {
            (Some(start), Some(_)) => {
                let row = sqlx::query(&format!(
                    "SELECT {} FROM audit_log WHERE timestamp < $1 \
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    AUDIT_COLUMNS
                ))
                .bind(start)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| VigilError::Database(e.to_string()))?;
                row.map(parse_audit_row)
            }
            _ => None,
        };

        Ok((entries, preceding))
    }

    /// Move entries older than the cutoff into the archive table. Archived
    /// entries remain queryable (`include_archived`) but leave default
    /// statistics.
    pub async fn archive(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let _guard = self.append_lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        sqlx::query("SELECT set_config('vigil.archiving', 'on', true)")
            .execute(&mut *tx)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        sqlx::query("INSERT INTO audit_log_archive SELECT * FROM audit_log WHERE timestamp < $1")
            .bind(older_than)
            .execute(&mut *tx)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        let deleted = sqlx::query("DELETE FROM audit_log WHERE timestamp < $1")
            .bind(older_than)
            .execute(&mut *tx)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        let moved = deleted.rows_affected();
        if moved > 0 {
            tracing::info!(moved = moved, "Archived audit entries");
        }
        Ok(moved)
    }
}

fn to_hash(bytes: &[u8]) -> [u8; 32] {
    bytes.try_into().unwrap_or([0u8; 32])
}

fn parse_audit_row(row: PgRow) -> AuditEntry {
    let event_type_str: String = row.get("event_type");
    let result_str: String = row.get("result");
    let severity_str: String = row.get("severity");
    let changes_json: serde_json::Value = row.get("changes");
    let metadata_json: serde_json::Value = row.get("metadata");
    let hash: Vec<u8> = row.get("hash");
    let previous_hash: Vec<u8> = row.get("previous_hash");

    AuditEntry {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        event_type: event_type_str
            .parse()
            .unwrap_or(AuditEventType::EmergencyAction),
        actor: AuditActor {
            user_id: row.get("user_id"),
            user_email: row.get("user_email"),
            user_role: row.get("user_role"),
        },
        action: row.get("action"),
        resource: row.get("resource"),
        resource_id: row.get("resource_id"),
        previous_value: row.get("previous_value"),
        new_value: row.get("new_value"),
        changes: serde_json::from_value(changes_json).unwrap_or_default(),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        session_id: row.get("session_id"),
        result: result_str.parse().unwrap_or(AuditResult::Failure),
        severity: severity_str.parse().unwrap_or(Severity::Info),
        error_message: row.get("error_message"),
        metadata: serde_json::from_value(metadata_json).unwrap_or_default(),
        hash: to_hash(&hash),
        previous_hash: to_hash(&previous_hash),
    }
}
