use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use vigil_core::audit::{AuditEntry, AuditEventType, AuditResult};
use vigil_core::rule::Severity;

use super::response::{ApiError, ApiResult};
use super::server::ApiState;
use crate::audit::{export, AuditQuery, AuditStats, ChainReport, ExportFormat, TamperFinding};

/// Query-string and search-body filter shape for audit logs.
#[derive(Debug, Default, Deserialize)]
pub struct AuditLogsQuery {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

impl AuditLogsQuery {
    fn to_query(&self) -> ApiResult<AuditQuery> {
        let event_type: Option<AuditEventType> = self
            .event_type
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()?;
        let result: Option<AuditResult> = self
            .result
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()?;
        let severity: Option<Severity> = self
            .severity
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()?;

        Ok(AuditQuery {
            event_type,
            user_email: self.user_email.clone(),
            action: self.action.clone(),
            resource: self.resource.clone(),
            result,
            severity,
            start_time: self.start_time,
            end_time: self.end_time,
            search: self.search.clone(),
            limit: self.limit,
            offset: self.offset,
            sort_by: self.sort_by.clone(),
            sort_order: self.sort_order.clone(),
            include_archived: self.include_archived,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeRangeBody {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub format: String,
    #[serde(default)]
    pub filters: AuditLogsQuery,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_logs(
    State(state): State<ApiState>,
    Query(query): Query<AuditLogsQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let query = query.to_query()?;
    Ok(Json(state.ledger.query(&query).await?))
}

pub async fn get_log(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AuditEntry>> {
    let entry = state
        .ledger
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("audit entry {}", id)))?;
    Ok(Json(entry))
}

/// POST search with the filter object in the body.
pub async fn search_logs(
    State(state): State<ApiState>,
    Json(body): Json<AuditLogsQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let query = body.to_query()?;
    Ok(Json(state.ledger.query(&query).await?))
}

/// Export matching entries as CSV or JSON with a selected field subset.
pub async fn export_logs(
    State(state): State<ApiState>,
    Json(body): Json<ExportRequest>,
) -> ApiResult<Response> {
    let format: ExportFormat = body.format.parse().map_err(ApiError::validation)?;
    let query = body.filters.to_query()?;

    let entries = state.ledger.query(&query).await?;
    let rendered = export(&entries, format, &body.fields)?;

    let (content_type, filename) = match format {
        ExportFormat::Csv => ("text/csv", "audit_log.csv"),
        ExportFormat::Json => ("application/json", "audit_log.json"),
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        rendered,
    )
        .into_response())
}

pub async fn stats(
    State(state): State<ApiState>,
    Query(range): Query<TimelineQuery>,
) -> ApiResult<Json<AuditStats>> {
    let stats = state
        .ledger
        .statistics(range.start_time, range.end_time)
        .await?;
    Ok(Json(stats))
}

pub async fn timeline(
    State(state): State<ApiState>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = state
        .ledger
        .timeline(query.start_time, query.end_time, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(entries))
}

pub async fn verify_chain(
    State(state): State<ApiState>,
    body: Result<Json<TimeRangeBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Json<ChainReport>> {
    // An absent or empty body means "the whole ledger".
    let range = body.map(|Json(b)| b).unwrap_or_default();
    let report = state
        .ledger
        .verify_chain(range.start_time, range.end_time)
        .await?;
    Ok(Json(report))
}

pub async fn detect_tampering(
    State(state): State<ApiState>,
    body: Result<Json<TimeRangeBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Json<Vec<TamperFinding>>> {
    let range = body.map(|Json(b)| b).unwrap_or_default();
    let findings = state
        .ledger
        .detect_tampering(range.start_time, range.end_time)
        .await?;
    Ok(Json(findings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_conversion() {
        let query = AuditLogsQuery {
            event_type: Some("auth.login".to_string()),
            result: Some("failure".to_string()),
            severity: Some("warning".to_string()),
            ..Default::default()
        };

        let converted = query.to_query().unwrap();
        assert_eq!(converted.event_type, Some(AuditEventType::AuthLogin));
        assert_eq!(converted.result, Some(AuditResult::Failure));
        assert_eq!(converted.severity, Some(Severity::Warning));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let query = AuditLogsQuery {
            event_type: Some("auth.impersonate".to_string()),
            ..Default::default()
        };
        assert!(query.to_query().is_err());
    }

    #[test]
    fn test_export_request_parses() {
        let body: ExportRequest = serde_json::from_value(serde_json::json!({
            "format": "csv",
            "filters": {"severity": "critical"},
            "fields": ["id", "event_type"],
        }))
        .unwrap();

        assert_eq!(body.format, "csv");
        assert_eq!(body.fields.len(), 2);
        assert_eq!(body.filters.severity.as_deref(), Some("critical"));
    }
}
