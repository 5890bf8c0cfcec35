use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vigil_core::alert::Alert;
use vigil_core::channel::{Channel, ChannelType};
use vigil_core::config::NotifyConfig;
use vigil_core::notification::Notification;
use vigil_core::rule::{Rule, Severity, ThresholdOp};
use vigil_core::{Result, SharedClock, VigilError};

use super::registry::ChannelRegistry;
use crate::channels::NotificationChannel;
use crate::engine::AlertEvent;
use crate::store::{ChannelStore, NotificationStore, RuleStore};

/// Outcome of delivering one alert (or batch) through one channel.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel_id: Uuid,
    pub channel_type: ChannelType,
    pub success: bool,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Aggregate result of a fan-out. Zero failed outcomes means success; any
/// channel-level failure surfaces here with per-channel details.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<ChannelOutcome>,
    /// Channels skipped by the disabled flag or a filter miss.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Retry policy for channel sends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base backoff; attempt k sleeps base * 2^(k-1) before retrying.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// Sleep before retry attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Terminal result of the retry loop for one (alert, channel).
#[derive(Debug, Clone)]
pub(crate) struct SendOutcome {
    pub success: bool,
    /// Retries consumed (0 = succeeded or failed on the first attempt).
    pub retry_count: u32,
    pub error: Option<String>,
}

type EnabledFuture = Pin<Box<dyn Future<Output = Option<bool>> + Send>>;

/// Run the retry loop for one delivery.
///
/// `still_enabled` is consulted between attempts; `None` (lookup failed)
/// leaves the loop running. Cancellation during a backoff sleep terminates
/// with a "cancelled" error.
pub(crate) async fn retry_send(
    imp: &dyn NotificationChannel,
    alert: &Alert,
    channel: &Channel,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    cancel: &CancellationToken,
    still_enabled: &(dyn Fn() -> EnabledFuture + Send + Sync),
) -> SendOutcome {
    let mut last_error = String::new();

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = policy.backoff_for(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return SendOutcome {
                        success: false,
                        retry_count: attempt - 1,
                        error: Some("cancelled".to_string()),
                    };
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            // Disabled mid-retry: stop before the next attempt.
            if still_enabled().await == Some(false) {
                return SendOutcome {
                    success: false,
                    retry_count: attempt - 1,
                    error: Some(format!("channel disabled during retries; last error: {}", last_error)),
                };
            }
        }

        match tokio::time::timeout(attempt_timeout, imp.send(alert, channel)).await {
            Ok(Ok(())) => {
                return SendOutcome {
                    success: true,
                    retry_count: attempt,
                    error: None,
                };
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                tracing::warn!(
                    channel = %channel.name,
                    attempt = attempt + 1,
                    error = %last_error,
                    "Notification attempt failed"
                );
            }
            Err(_) => {
                last_error = format!("send timed out after {:?}", attempt_timeout);
                tracing::warn!(
                    channel = %channel.name,
                    attempt = attempt + 1,
                    "Notification attempt timed out"
                );
            }
        }
    }

    SendOutcome {
        success: false,
        retry_count: policy.max_retries,
        error: Some(last_error),
    }
}

/// Fans alerts out across configured channels with retries, filters, and
/// optional batching, persisting one Notification row per terminal outcome.
pub struct Dispatcher {
    config: NotifyConfig,
    rule_store: RuleStore,
    channel_store: ChannelStore,
    notification_store: NotificationStore,
    registry: Arc<ChannelRegistry>,
    clock: SharedClock,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: NotifyConfig,
        rule_store: RuleStore,
        channel_store: ChannelStore,
        notification_store: NotificationStore,
        registry: Arc<ChannelRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            rule_store,
            channel_store,
            notification_store,
            registry,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel pending retries (shutdown path).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Notification policy over engine events: created alerts and
    /// (unacknowledged) resolutions notify; refreshes and dedup attaches do
    /// not; acknowledged alerts stay quiet until a new active transition.
    pub async fn handle_event(&self, event: AlertEvent) {
        let result = match event {
            AlertEvent::Created(alert) => self.send_alert(&alert).await.map(|_| ()),
            AlertEvent::Resolved(alert) => {
                if alert.acknowledged_by.is_some() {
                    Ok(())
                } else {
                    self.send_alert(&alert).await.map(|_| ())
                }
            }
            AlertEvent::Updated(_) => Ok(()),
            AlertEvent::Grouped { alerts } => self.batch_send(&alerts).await.map(|_| ()),
        };

        if let Err(e) = result {
            tracing::error!("Notification dispatch failed: {}", e);
        }
    }

    /// Deliver an alert through every configured, enabled, filter-matching
    /// channel of its rule.
    pub async fn send_alert(&self, alert: &Alert) -> Result<DispatchReport> {
        let rule = self
            .rule_store
            .get(alert.rule_id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("rule {}", alert.rule_id)))?;

        let mut report = DispatchReport::default();

        for channel_id in &rule.channels {
            match self.resolve_channel(*channel_id, alert).await? {
                Resolution::Skip => report.skipped += 1,
                Resolution::Fatal(channel, error) => {
                    let outcome = self
                        .record_outcome(
                            alert.id.to_string(),
                            &channel,
                            SendOutcome {
                                success: false,
                                retry_count: 0,
                                error: Some(error),
                            },
                        )
                        .await;
                    report.outcomes.push(outcome);
                }
                Resolution::Deliver(channel, imp) => {
                    let outcome = self.deliver_single(alert, &channel, imp.as_ref()).await;
                    report.outcomes.push(outcome);
                }
            }
        }

        Ok(report)
    }

    /// Group alerts per channel and deliver each group in one call where the
    /// channel implementation supports batching; fall back to per-alert
    /// sends otherwise.
    pub async fn batch_send(&self, alerts: &[Alert]) -> Result<DispatchReport> {
        if !self.config.batch_notifications {
            let mut report = DispatchReport::default();
            for alert in alerts {
                let sub = self.send_alert(alert).await?;
                report.outcomes.extend(sub.outcomes);
                report.skipped += sub.skipped;
            }
            return Ok(report);
        }

        // channel id -> (channel, members)
        let mut groups: HashMap<Uuid, (Channel, Arc<dyn NotificationChannel>, Vec<Alert>)> =
            HashMap::new();
        let mut report = DispatchReport::default();

        for alert in alerts {
            let Some(rule) = self.rule_store.get(alert.rule_id).await? else {
                continue;
            };
            for channel_id in &rule.channels {
                match self.resolve_channel(*channel_id, alert).await? {
                    Resolution::Skip => report.skipped += 1,
                    Resolution::Fatal(channel, error) => {
                        let outcome = self
                            .record_outcome(
                                alert.id.to_string(),
                                &channel,
                                SendOutcome {
                                    success: false,
                                    retry_count: 0,
                                    error: Some(error),
                                },
                            )
                            .await;
                        report.outcomes.push(outcome);
                    }
                    Resolution::Deliver(channel, imp) => {
                        groups
                            .entry(*channel_id)
                            .or_insert_with(|| (channel, imp, Vec::new()))
                            .2
                            .push(alert.clone());
                    }
                }
            }
        }

        for (_, (channel, imp, members)) in groups {
            if imp.supports_batch() && members.len() > 1 {
                for chunk in members.chunks(self.config.batch_size.max(1)) {
                    let outcome = self.deliver_batch(chunk, &channel, imp.as_ref()).await;
                    report.outcomes.push(outcome);

                    if self.config.batch_delay_ms > 0 {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Ok(report),
                            _ = tokio::time::sleep(self.config.batch_delay()) => {}
                        }
                    }
                }
            } else {
                for alert in &members {
                    let outcome = self.deliver_single(alert, &channel, imp.as_ref()).await;
                    report.outcomes.push(outcome);
                }
            }
        }

        Ok(report)
    }

    /// Send a synthetic info-severity test alert through one channel,
    /// bypassing filters.
    pub async fn test_channel(&self, channel_id: Uuid) -> Result<ChannelOutcome> {
        let channel = self
            .channel_store
            .get(channel_id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("channel {}", channel_id)))?;

        if !channel.enabled {
            return Err(VigilError::Validation(format!(
                "channel '{}' is disabled",
                channel.name
            )));
        }

        let imp = self.registry.get(channel.channel_type).ok_or_else(|| {
            VigilError::Validation(format!("unknown channel type: {}", channel.channel_type))
        })?;

        let alert = test_alert(self.clock.now());
        Ok(self.deliver_single(&alert, &channel, imp.as_ref()).await)
    }

    /// Resolve one channel id for an alert.
    async fn resolve_channel(&self, channel_id: Uuid, alert: &Alert) -> Result<Resolution> {
        let Some(channel) = self.channel_store.get(channel_id).await? else {
            tracing::warn!(channel_id = %channel_id, "Rule references missing channel");
            return Ok(Resolution::Skip);
        };

        if !channel.enabled {
            return Ok(Resolution::Skip);
        }

        if !channel.matches(alert) {
            tracing::debug!(
                channel = %channel.name,
                alert = %alert.id,
                "Channel filters do not match"
            );
            return Ok(Resolution::Skip);
        }

        match self.registry.get(channel.channel_type) {
            Some(imp) => Ok(Resolution::Deliver(channel, imp)),
            None => {
                let error = format!("unknown channel type: {}", channel.channel_type);
                Ok(Resolution::Fatal(channel, error))
            }
        }
    }

    async fn deliver_single(
        &self,
        alert: &Alert,
        channel: &Channel,
        imp: &dyn NotificationChannel,
    ) -> ChannelOutcome {
        let policy = RetryPolicy::from_config(&self.config);
        let store = self.channel_store.clone();
        let channel_id = channel.id;
        let still_enabled = move || -> EnabledFuture {
            let store = store.clone();
            Box::pin(async move {
                match store.get(channel_id).await {
                    Ok(row) => Some(row.map(|c| c.enabled).unwrap_or(false)),
                    Err(e) => {
                        tracing::warn!("Channel enabled re-check failed: {}", e);
                        None
                    }
                }
            })
        };

        let outcome = retry_send(
            imp,
            alert,
            channel,
            &policy,
            self.config.notification_timeout(),
            &self.cancel,
            &still_enabled,
        )
        .await;

        self.record_outcome(alert.id.to_string(), channel, outcome).await
    }

    async fn deliver_batch(
        &self,
        alerts: &[Alert],
        channel: &Channel,
        imp: &dyn NotificationChannel,
    ) -> ChannelOutcome {
        let policy = RetryPolicy::from_config(&self.config);
        let mut last_error = String::new();
        let mut outcome = SendOutcome {
            success: false,
            retry_count: policy.max_retries,
            error: None,
        };

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let backoff = policy.backoff_for(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        outcome = SendOutcome {
                            success: false,
                            retry_count: attempt - 1,
                            error: Some("cancelled".to_string()),
                        };
                        return self
                            .record_outcome(Notification::batch_alert_id(alerts.len()), channel, outcome)
                            .await;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            match tokio::time::timeout(
                self.config.notification_timeout(),
                imp.send_batch(alerts, channel),
            )
            .await
            {
                Ok(Ok(())) => {
                    outcome = SendOutcome {
                        success: true,
                        retry_count: attempt,
                        error: None,
                    };
                    break;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error =
                        format!("send timed out after {:?}", self.config.notification_timeout())
                }
            }

            outcome = SendOutcome {
                success: false,
                retry_count: attempt,
                error: Some(last_error.clone()),
            };
        }

        self.record_outcome(Notification::batch_alert_id(alerts.len()), channel, outcome)
            .await
    }

    /// Persist the terminal outcome and return it for the report.
    async fn record_outcome(
        &self,
        alert_id: String,
        channel: &Channel,
        outcome: SendOutcome,
    ) -> ChannelOutcome {
        let now = self.clock.now();
        let notification = if outcome.success {
            Notification::success(&alert_id, channel.id, channel.channel_type, outcome.retry_count, now)
        } else {
            Notification::failure(
                &alert_id,
                channel.id,
                channel.channel_type,
                outcome.retry_count,
                outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                now,
            )
        };

        if let Err(e) = self.notification_store.create(&notification).await {
            tracing::error!(
                channel = %channel.name,
                "Failed to persist notification record: {}",
                e
            );
        }

        ChannelOutcome {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            success: outcome.success,
            retry_count: outcome.retry_count,
            error: outcome.error,
        }
    }
}

enum Resolution {
    /// Disabled channel or filter miss: no send, no Notification row.
    Skip,
    /// Unknown type or broken config: recorded as a non-retried failure.
    Fatal(Channel, String),
    Deliver(Channel, Arc<dyn NotificationChannel>),
}

/// Synthetic alert used by channel tests.
fn test_alert(now: chrono::DateTime<chrono::Utc>) -> Alert {
    let rule = Rule::new(
        "vigil_channel_test",
        "vector(1)",
        ThresholdOp::Ge,
        1.0,
    )
    .with_severity(Severity::Info)
    .with_source("vigil");

    let mut alert = Alert::firing(&rule, 1.0, now);
    alert.message = "Test notification from vigil".to_string();
    alert
}
