use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use vigil_core::audit::{AuditEvent, AuditEventType};
use vigil_core::rule::{Rule, Severity, ThresholdOp};

use super::auth::{require_writer, Principal};
use super::response::{ApiError, ApiResult};
use super::server::ApiState;
use crate::engine::EvalReport;

/// Create/update payload for rules. Unrecognized fields are ignored.
#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub name: String,
    pub expression: String,
    pub operator: String,
    pub threshold: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub for_duration_secs: Option<u64>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub channels: Option<Vec<Uuid>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RuleRequest {
    fn operator(&self) -> ApiResult<ThresholdOp> {
        self.operator.parse().map_err(ApiError::validation)
    }

    fn severity(&self) -> ApiResult<Option<Severity>> {
        self.severity
            .as_deref()
            .map(|s| s.parse().map_err(ApiError::validation))
            .transpose()
    }

    fn apply(&self, rule: &mut Rule) -> ApiResult<()> {
        rule.name = self.name.clone();
        rule.expression = self.expression.clone();
        rule.operator = self.operator()?;
        rule.threshold = self.threshold;
        if let Some(description) = &self.description {
            rule.description = Some(description.clone());
        }
        if let Some(severity) = self.severity()? {
            rule.severity = severity;
        }
        if let Some(source) = &self.source {
            rule.source = source.clone();
        }
        if let Some(secs) = self.for_duration_secs {
            rule.for_duration_secs = secs;
        }
        if let Some(secs) = self.interval_secs {
            rule.interval_secs = secs;
        }
        if let Some(labels) = &self.labels {
            rule.labels = labels.clone();
        }
        if let Some(annotations) = &self.annotations {
            rule.annotations = annotations.clone();
        }
        if let Some(channels) = &self.channels {
            rule.channels = channels.clone();
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        Ok(())
    }
}

pub async fn list_rules(State(state): State<ApiState>) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.rule_store.list().await?))
}

pub async fn get_rule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    let rule = state
        .rule_store
        .get(id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or_else(|| ApiError::not_found(format!("rule {}", id)))?;
    Ok(Json(rule))
}

pub async fn create_rule(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<RuleRequest>,
) -> ApiResult<Json<Rule>> {
    require_writer(&principal)?;

    if body.name.trim().is_empty() {
        return Err(ApiError::validation("rule name must not be empty"));
    }
    if body.expression.trim().is_empty() {
        return Err(ApiError::validation("rule expression must not be empty"));
    }

    let mut rule = Rule::new(&body.name, &body.expression, body.operator()?, body.threshold);
    body.apply(&mut rule)?;

    state.rule_store.create(&rule).await?;

    state
        .audit(
            AuditEvent::new(
                AuditEventType::AlertRuleCreated,
                principal.audit_actor(),
                "create",
                "alert_rule",
                rule.id.to_string(),
            )
            .with_values(None, serde_json::to_value(&rule).ok())
            .with_request_context(
                &principal.client_ip,
                &principal.user_agent,
                &principal.session_id,
            ),
        )
        .await;

    Ok(Json(rule))
}

pub async fn update_rule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<RuleRequest>,
) -> ApiResult<Json<Rule>> {
    require_writer(&principal)?;

    let mut rule = state
        .rule_store
        .get(id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or_else(|| ApiError::not_found(format!("rule {}", id)))?;

    let previous = serde_json::to_value(&rule).ok();
    body.apply(&mut rule)?;
    state.rule_store.update(&rule).await?;

    state
        .audit(
            AuditEvent::new(
                AuditEventType::AlertRuleUpdated,
                principal.audit_actor(),
                "update",
                "alert_rule",
                rule.id.to_string(),
            )
            .with_values(previous, serde_json::to_value(&rule).ok())
            .with_request_context(
                &principal.client_ip,
                &principal.user_agent,
                &principal.session_id,
            ),
        )
        .await;

    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    require_writer(&principal)?;

    let previous = state.rule_store.get(id).await?;
    state.rule_store.soft_delete(id).await?;

    state
        .audit(
            AuditEvent::new(
                AuditEventType::AlertRuleDeleted,
                principal.audit_actor(),
                "delete",
                "alert_rule",
                id.to_string(),
            )
            .with_values(previous.and_then(|r| serde_json::to_value(&r).ok()), None)
            .with_request_context(
                &principal.client_ip,
                &principal.user_agent,
                &principal.session_id,
            ),
        )
        .await;

    Ok(Json(serde_json::json!({"deleted": id})))
}

/// Force one evaluation pass for a rule.
pub async fn evaluate_rule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<EvalReportBody>> {
    require_writer(&principal)?;

    let report = state.engine.evaluate_once(id).await?;
    Ok(Json(EvalReportBody::from(report)))
}

/// Wire shape of an evaluation report.
#[derive(Debug, serde::Serialize)]
pub struct EvalReportBody {
    pub rule_id: Uuid,
    pub value: Option<f64>,
    pub firing: bool,
    pub would_create_alert: bool,
}

impl From<EvalReport> for EvalReportBody {
    fn from(report: EvalReport) -> Self {
        Self {
            rule_id: report.rule_id,
            value: report.value,
            firing: report.firing,
            would_create_alert: report.would_create_alert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(operator: &str) -> RuleRequest {
        serde_json::from_value(serde_json::json!({
            "name": "cpu_high",
            "expression": "cpu_usage",
            "operator": operator,
            "threshold": 90.0,
        }))
        .unwrap()
    }

    #[test]
    fn test_operator_validation() {
        assert!(request("gt").operator().is_ok());
        assert!(request("between").operator().is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let body: RuleRequest = serde_json::from_value(serde_json::json!({
            "name": "r",
            "expression": "e",
            "operator": "lt",
            "threshold": 1.0,
            "definitely_not_a_field": true,
        }))
        .unwrap();
        assert_eq!(body.name, "r");
    }

    #[test]
    fn test_apply_overrides_only_provided_fields() {
        let mut rule = Rule::new("old", "old_expr", ThresholdOp::Gt, 1.0)
            .with_severity(Severity::Critical);

        let body = request("ge");
        body.apply(&mut rule).unwrap();

        assert_eq!(rule.name, "cpu_high");
        assert_eq!(rule.operator, ThresholdOp::Ge);
        // Not provided in the payload: untouched.
        assert_eq!(rule.severity, Severity::Critical);
    }

    #[test]
    fn test_bad_severity_rejected() {
        let body: RuleRequest = serde_json::from_value(serde_json::json!({
            "name": "r",
            "expression": "e",
            "operator": "gt",
            "threshold": 1.0,
            "severity": "catastrophic",
        }))
        .unwrap();
        assert!(body.severity().is_err());
    }
}
