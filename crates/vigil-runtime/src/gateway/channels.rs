use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use vigil_core::channel::{Channel, ChannelFilter, ChannelType, FilterOp};

use super::auth::{require_writer, Principal};
use super::response::{ApiError, ApiResult};
use super::server::ApiState;
use crate::dispatch::ChannelOutcome;

/// Create/update payload for channels.
#[derive(Debug, Deserialize)]
pub struct ChannelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub filters: Vec<FilterBody>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct FilterBody {
    pub field: String,
    pub op: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl ChannelRequest {
    fn channel_type(&self) -> ApiResult<ChannelType> {
        self.channel_type.parse().map_err(ApiError::validation)
    }

    fn filters(&self) -> ApiResult<Vec<ChannelFilter>> {
        self.filters
            .iter()
            .map(|f| {
                let op: FilterOp = f.op.parse().map_err(ApiError::validation)?;
                Ok(ChannelFilter::new(&f.field, op, f.values.clone()))
            })
            .collect()
    }

    fn apply(&self, channel: &mut Channel) -> ApiResult<()> {
        channel.name = self.name.clone();
        channel.channel_type = self.channel_type()?;
        channel.config = self.config.clone();
        channel.filters = self.filters()?;
        if let Some(enabled) = self.enabled {
            channel.enabled = enabled;
        }
        Ok(())
    }
}

pub async fn list_channels(State(state): State<ApiState>) -> ApiResult<Json<Vec<Channel>>> {
    Ok(Json(state.channel_store.list().await?))
}

pub async fn get_channel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Channel>> {
    let channel = state
        .channel_store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("channel {}", id)))?;
    Ok(Json(channel))
}

pub async fn create_channel(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ChannelRequest>,
) -> ApiResult<Json<Channel>> {
    require_writer(&principal)?;

    if body.name.trim().is_empty() {
        return Err(ApiError::validation("channel name must not be empty"));
    }

    let mut channel = Channel::new(&body.name, body.channel_type()?);
    body.apply(&mut channel)?;

    state.channel_store.create(&channel).await?;
    Ok(Json(channel))
}

pub async fn update_channel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ChannelRequest>,
) -> ApiResult<Json<Channel>> {
    require_writer(&principal)?;

    let mut channel = state
        .channel_store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("channel {}", id)))?;

    body.apply(&mut channel)?;
    state.channel_store.update(&channel).await?;
    Ok(Json(channel))
}

pub async fn delete_channel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    require_writer(&principal)?;

    state.channel_store.delete(id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

/// Send a synthetic test alert through one channel.
pub async fn test_channel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<TestOutcomeBody>> {
    require_writer(&principal)?;

    let outcome = state.dispatcher.test_channel(id).await?;
    Ok(Json(TestOutcomeBody::from(outcome)))
}

/// Wire shape of a channel test outcome.
#[derive(Debug, serde::Serialize)]
pub struct TestOutcomeBody {
    pub channel_id: Uuid,
    pub success: bool,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ChannelOutcome> for TestOutcomeBody {
    fn from(outcome: ChannelOutcome) -> Self {
        Self {
            channel_id: outcome.channel_id,
            success: outcome.success,
            retry_count: outcome.retry_count,
            error: outcome.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_type_validation() {
        let body: ChannelRequest = serde_json::from_value(serde_json::json!({
            "name": "hook",
            "type": "webhook",
        }))
        .unwrap();
        assert_eq!(body.channel_type().unwrap(), ChannelType::Webhook);

        let body: ChannelRequest = serde_json::from_value(serde_json::json!({
            "name": "hook",
            "type": "carrier-pigeon",
        }))
        .unwrap();
        assert!(body.channel_type().is_err());
    }

    #[test]
    fn test_filter_op_validation() {
        let body: ChannelRequest = serde_json::from_value(serde_json::json!({
            "name": "hook",
            "type": "webhook",
            "filters": [{"field": "severity", "op": "in", "values": ["critical"]}],
        }))
        .unwrap();
        let filters = body.filters().unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].op, FilterOp::In);

        let body: ChannelRequest = serde_json::from_value(serde_json::json!({
            "name": "hook",
            "type": "webhook",
            "filters": [{"field": "severity", "op": "matches", "values": []}],
        }))
        .unwrap();
        assert!(body.filters().is_err());
    }

    #[test]
    fn test_apply_builds_channel() {
        let body: ChannelRequest = serde_json::from_value(serde_json::json!({
            "name": "pager",
            "type": "slack",
            "config": {"url": "https://hooks.slack.com/x"},
            "enabled": false,
        }))
        .unwrap();

        let mut channel = Channel::new("old", ChannelType::Webhook);
        body.apply(&mut channel).unwrap();

        assert_eq!(channel.name, "pager");
        assert_eq!(channel.channel_type, ChannelType::Slack);
        assert!(!channel.enabled);
        assert_eq!(
            channel.config_str("url").unwrap(),
            "https://hooks.slack.com/x"
        );
    }
}
