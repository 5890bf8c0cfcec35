pub mod audit;
pub mod cache;
pub mod channels;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod gateway;
pub mod migrations;
pub mod store;

pub use audit::{AuditLedger, AuditQuery, AuditStats, ChainReport, TamperFinding, TamperKind};
pub use cache::StateCache;
pub use channels::{EmailChannel, NotificationChannel, SmsChannel, WebhookChannel};
pub use db::Database;
pub use dispatch::{ChannelOutcome, ChannelRegistry, DispatchReport, Dispatcher, RetryPolicy};
pub use engine::{AlertEvent, AlertSink, EvalReport, QueueSink, RulesEngine};
pub use gateway::{ApiState, AuthMiddleware, GatewayServer, Principal, RateLimiter};
pub use migrations::{Migration, MigrationRunner};
pub use store::{AlertFilter, AlertStore, ChannelStore, NotificationStore, RuleStore};
