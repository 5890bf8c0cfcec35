use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use vigil_core::alert::{Alert, AlertStatus};
use vigil_core::audit::{AuditEvent, AuditEventType};
use vigil_core::rule::Severity;

use super::auth::{require_writer, Principal};
use super::response::{ApiError, ApiResult};
use super::server::ApiState;
use crate::store::AlertFilter;

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub rule_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl AlertsQuery {
    fn to_filter(&self) -> ApiResult<AlertFilter> {
        let status: Option<AlertStatus> = self
            .status
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()?;
        let severity: Option<Severity> = self
            .severity
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()?;

        Ok(AlertFilter {
            status,
            severity,
            rule_id: self.rule_id,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

pub async fn list_alerts(
    State(state): State<ApiState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Json<Vec<Alert>>> {
    let filter = query.to_filter()?;
    Ok(Json(state.alert_store.list(&filter).await?))
}

pub async fn get_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    let alert = state
        .alert_store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert {}", id)))?;
    Ok(Json(alert))
}

/// Acknowledge an alert. Acknowledging an already-acknowledged or resolved
/// alert is a no-op returning the current row.
pub async fn acknowledge_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<Alert>> {
    require_writer(&principal)?;

    let alert = state
        .alert_store
        .acknowledge(id, &principal.user_email, state.clock.now())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert {}", id)))?;

    state
        .audit(
            AuditEvent::new(
                AuditEventType::AlertAcknowledged,
                principal.audit_actor(),
                "acknowledge",
                "alert",
                id.to_string(),
            )
            .with_request_context(
                &principal.client_ip,
                &principal.user_agent,
                &principal.session_id,
            ),
        )
        .await;

    Ok(Json(alert))
}

/// Resolve an alert by admin action. Resolving a resolved alert is a no-op
/// returning the current row.
pub async fn resolve_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<Alert>> {
    require_writer(&principal)?;

    let alert = state
        .alert_store
        .resolve(id, state.clock.now())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert {}", id)))?;

    state
        .audit(
            AuditEvent::new(
                AuditEventType::AlertResolved,
                principal.audit_actor(),
                "resolve",
                "alert",
                id.to_string(),
            )
            .with_request_context(
                &principal.client_ip,
                &principal.user_agent,
                &principal.session_id,
            ),
        )
        .await;

    Ok(Json(alert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_to_filter() {
        let query = AlertsQuery {
            status: Some("active".to_string()),
            severity: Some("critical".to_string()),
            rule_id: None,
            limit: Some(20),
            offset: None,
        };

        let filter = query.to_filter().unwrap();
        assert_eq!(filter.status, Some(AlertStatus::Active));
        assert_eq!(filter.severity, Some(Severity::Critical));
        assert_eq!(filter.limit, Some(20));
    }

    #[test]
    fn test_bad_status_rejected() {
        let query = AlertsQuery {
            status: Some("pending".to_string()),
            ..Default::default()
        };
        assert!(query.to_filter().is_err());
    }

    #[test]
    fn test_empty_query_is_unfiltered() {
        let filter = AlertsQuery::default().to_filter().unwrap();
        assert!(filter.status.is_none());
        assert!(filter.severity.is_none());
        assert!(filter.rule_id.is_none());
    }
}
