pub mod alert;
pub mod audit;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod notification;
pub mod rate_limit;
pub mod rule;

pub use alert::{Alert, AlertStatus};
pub use audit::{
    AuditActor, AuditEntry, AuditEvent, AuditEventType, AuditResult, GENESIS_HASH,
};
pub use channel::{Channel, ChannelFilter, ChannelType, FilterOp};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{DatabaseConfig, SmtpSecurity, VigilConfig};
pub use error::{Result, VigilError};
pub use eval::{decide, EvalDecision, EvalState, QueryOutcome};
pub use metrics::{HttpMetricsProvider, MetricSample, MetricsProvider, StaticProvider};
pub use notification::Notification;
pub use rate_limit::{RateLimitConfig, RateLimitResult, RequestClass};
pub use rule::{fingerprint, Rule, Severity, ThresholdOp};
