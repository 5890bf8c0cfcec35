use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use vigil_core::audit::AuditEvent;
use vigil_core::config::HttpConfig;
use vigil_core::SharedClock;

use super::auth::{auth_middleware, AuthMiddleware};
use super::rate_limit::{rate_limit_middleware, RateLimiter};
use super::{alerts, audit as audit_handlers, channels, rules};
use crate::audit::AuditLedger;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::engine::RulesEngine;
use crate::store::{AlertStore, ChannelStore, RuleStore};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub rule_store: RuleStore,
    pub channel_store: ChannelStore,
    pub alert_store: AlertStore,
    pub ledger: Arc<AuditLedger>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<RulesEngine>,
    pub db: Database,
    pub clock: SharedClock,
}

impl ApiState {
    /// Append an audit entry, logging (not failing the request) on error.
    pub async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.ledger.append(event).await {
            tracing::error!("Failed to append audit entry: {}", e);
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub engine_running: bool,
}

/// HTTP API server.
pub struct GatewayServer {
    config: HttpConfig,
    auth: Arc<AuthMiddleware>,
    limiter: Arc<RateLimiter>,
    state: ApiState,
}

impl GatewayServer {
    pub fn new(
        config: HttpConfig,
        auth: Arc<AuthMiddleware>,
        limiter: Arc<RateLimiter>,
        state: ApiState,
    ) -> Self {
        Self {
            config,
            auth,
            limiter,
            state,
        }
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        let api = Router::new()
            // Rules
            .route("/rules", get(rules::list_rules).post(rules::create_rule))
            .route(
                "/rules/{id}",
                get(rules::get_rule)
                    .put(rules::update_rule)
                    .delete(rules::delete_rule),
            )
            .route("/rules/{id}/evaluate", post(rules::evaluate_rule))
            // Channels
            .route(
                "/channels",
                get(channels::list_channels).post(channels::create_channel),
            )
            .route(
                "/channels/{id}",
                get(channels::get_channel)
                    .put(channels::update_channel)
                    .delete(channels::delete_channel),
            )
            .route("/channels/{id}/test", post(channels::test_channel))
            // Alerts
            .route("/alerts", get(alerts::list_alerts))
            .route("/alerts/{id}", get(alerts::get_alert))
            .route("/alerts/{id}/acknowledge", post(alerts::acknowledge_alert))
            .route("/alerts/{id}/resolve", post(alerts::resolve_alert))
            // Audit
            .route("/audit/logs", get(audit_handlers::list_logs))
            .route("/audit/logs/search", post(audit_handlers::search_logs))
            .route("/audit/logs/export", post(audit_handlers::export_logs))
            .route("/audit/logs/{id}", get(audit_handlers::get_log))
            .route("/audit/stats", get(audit_handlers::stats))
            .route("/audit/timeline", get(audit_handlers::timeline))
            .route(
                "/audit/integrity/verify",
                post(audit_handlers::verify_chain),
            )
            .route(
                "/audit/integrity/detect-tampering",
                post(audit_handlers::detect_tampering),
            )
            .with_state(self.state.clone());

        let cors = if self.config.cors_enabled {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            CorsLayer::new()
        };

        // Auth resolves the principal first; rate limiting buckets by it.
        // The timeout bounds handler time, which caps the DB work a request
        // can hold.
        let middleware_stack = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(std::time::Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            .layer(cors)
            .layer(middleware::from_fn_with_state(
                self.auth.clone(),
                auth_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                self.limiter.clone(),
                rate_limit_middleware,
            ));

        Router::new()
            .route("/health", get(health_handler).with_state(self.state.clone()))
            .nest("/api/v1", api)
            .layer(middleware_stack)
    }

    /// The socket address to bind to.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.config.port))
    }

    /// Serve until the cancellation token fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), std::io::Error> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!("HTTP API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    }
}

/// Health check: process, database, and engine status.
async fn health_handler(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> Json<HealthResponse> {
    let database = match state.db.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };

    let engine_running = state.engine.is_running();
    let status = if database == "ok" && engine_running {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        engine_running,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let resp = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            database: "ok".to_string(),
            engine_running: true,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("engine_running"));
    }
}
