//! HTTP API: CRUD over rules/channels/alerts and the audit surface.

mod alerts;
mod audit;
mod auth;
mod channels;
mod rate_limit;
mod response;
mod rules;
mod server;

pub use auth::{AuthMiddleware, Principal};
pub use rate_limit::RateLimiter;
pub use response::{ApiError, ApiResult};
pub use server::{ApiState, GatewayServer, HealthResponse};
