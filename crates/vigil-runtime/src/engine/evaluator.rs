use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use vigil_core::alert::{Alert, AlertStatus};
use vigil_core::config::EngineConfig;
use vigil_core::eval::{decide, EvalDecision, EvalState, QueryOutcome};
use vigil_core::metrics::MetricsProvider;
use vigil_core::rule::{fingerprint, Rule, Severity};
use vigil_core::{Result, SharedClock, VigilError};

use super::grouping::GroupBuffer;
use super::sink::{AlertEvent, AlertSink};
use crate::cache::{eval_state_key, StateCache};
use crate::store::{AlertStore, RuleStore};

/// Result of a forced single evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub rule_id: Uuid,
    /// Observed value; None when the metrics query failed.
    pub value: Option<f64>,
    /// Whether the rule is in the firing state after this pass.
    pub firing: bool,
    /// Whether this pass would create (or just created) a new alert.
    pub would_create_alert: bool,
}

/// What to do with an open alert found under the firing fingerprint.
#[derive(Debug, PartialEq, Eq)]
enum DedupAction {
    /// Attach to it: bump updated_at, refresh value.
    Attach,
    /// It predates the window (left over from a previous incarnation):
    /// resolve it and create a fresh alert, keeping the fingerprint unique.
    ResolveStaleAndCreate,
}

fn dedup_action(
    existing_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> DedupAction {
    if now - existing_created_at <= window {
        DedupAction::Attach
    } else {
        DedupAction::ResolveStaleAndCreate
    }
}

/// Fingerprint of the internal evaluation-degraded alert for a rule.
fn degraded_fingerprint(rule_id: Uuid) -> String {
    let mut labels = HashMap::new();
    labels.insert("vigil".to_string(), "evaluation-degraded".to_string());
    fingerprint(rule_id, &labels)
}

/// Internal info alert reporting a metrics failure streak for a rule.
fn degraded_alert(rule: &Rule, failures: u32, now: DateTime<Utc>) -> Alert {
    let mut labels = HashMap::new();
    labels.insert("vigil".to_string(), "evaluation-degraded".to_string());
    labels.insert("rule_id".to_string(), rule.id.to_string());

    Alert {
        id: Uuid::new_v4(),
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        source: "vigil".to_string(),
        severity: Severity::Info,
        status: AlertStatus::Active,
        message: format!(
            "rule evaluation degraded: {} consecutive metrics failures for '{}'",
            failures, rule.name
        ),
        description: None,
        value: 0.0,
        threshold: 0.0,
        fingerprint: degraded_fingerprint(rule.id),
        labels,
        annotations: HashMap::new(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
        resolved_at: None,
        acknowledged_by: None,
    }
}

/// Periodic rule evaluation engine.
///
/// A driver tick enqueues due enabled rules; a semaphore-capped worker pool
/// evaluates them. Evaluation is serialized per rule: a rule whose previous
/// evaluation is still running is skipped, never queued twice.
pub struct RulesEngine {
    config: EngineConfig,
    rule_store: RuleStore,
    alert_store: AlertStore,
    provider: Arc<dyn MetricsProvider>,
    clock: SharedClock,
    cache: Arc<StateCache>,
    states: Mutex<HashMap<Uuid, EvalState>>,
    in_flight: Mutex<HashSet<Uuid>>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    semaphore: Arc<Semaphore>,
    groups: Option<GroupBuffer>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    self_handle: Weak<RulesEngine>,
}

impl RulesEngine {
    pub fn new(
        config: EngineConfig,
        rule_store: RuleStore,
        alert_store: AlertStore,
        provider: Arc<dyn MetricsProvider>,
        clock: SharedClock,
        cache: Arc<StateCache>,
    ) -> Arc<Self> {
        let groups = config
            .enable_grouping
            .then(|| GroupBuffer::new(config.grouping_window()));

        Arc::new_cyclic(|weak| Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_evals)),
            config,
            rule_store,
            alert_store,
            provider,
            clock,
            cache,
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            sinks: RwLock::new(Vec::new()),
            groups,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            self_handle: weak.clone(),
        })
    }

    /// Install a sink invoked on alert creation, update, and resolution.
    pub fn register_handler(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().expect("sink lock poisoned").push(sink);
    }

    /// Begin periodic evaluation. Fails if already started or stopped.
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(VigilError::InvalidState("engine already stopped".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VigilError::InvalidState("engine already started".to_string()));
        }

        let engine = self
            .self_handle
            .upgrade()
            .ok_or_else(|| VigilError::Internal("engine handle dropped".to_string()))?;
        tokio::spawn(async move {
            engine.drive().await;
        });

        tracing::info!(
            interval_secs = self.config.evaluation_interval_secs,
            workers = self.config.max_concurrent_evals,
            "Rules engine started"
        );
        Ok(())
    }

    /// Request cancellation, await in-flight evaluations up to the shutdown
    /// deadline, flush open grouping windows, then close.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_deadline(), self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                deadline_secs = self.config.shutdown_deadline_secs,
                "Shutdown deadline elapsed with evaluations still in flight"
            );
        }

        if let Some(ref groups) = self.groups {
            for (_, alerts) in groups.flush_all() {
                if !alerts.is_empty() {
                    self.emit(&AlertEvent::Grouped { alerts });
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Rules engine stopped");
    }

    /// Whether the engine is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Force one evaluation pass for a rule.
    pub async fn evaluate_once(&self, rule_id: Uuid) -> Result<EvalReport> {
        let rule = self
            .rule_store
            .get(rule_id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("rule {}", rule_id)))?;

        if !self.begin_evaluation(rule_id) {
            return Err(VigilError::InvalidState(format!(
                "rule {} is already being evaluated",
                rule_id
            )));
        }

        let result = self.evaluate_rule(&rule).await;
        self.finish_evaluation(rule_id);

        let (value, decision) = result?;
        Ok(EvalReport {
            rule_id,
            value,
            firing: matches!(
                decision,
                EvalDecision::Fire { .. } | EvalDecision::Refresh { .. }
            ),
            would_create_alert: matches!(decision, EvalDecision::Fire { .. }),
        })
    }

    /// Driver loop: tick, flush due groups, enqueue due rules.
    async fn drive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.evaluation_interval());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = self.clock.now();

            if let Some(ref groups) = self.groups {
                for (key, alerts) in groups.flush_due(now) {
                    tracing::debug!(
                        source = %key.source,
                        severity = %key.severity,
                        count = alerts.len(),
                        "Flushing alert group"
                    );
                    self.emit(&AlertEvent::Grouped { alerts });
                }
            }

            let rules = match self.rule_store.list_enabled().await {
                Ok(rules) => rules,
                Err(e) => {
                    tracing::error!("Failed to list rules: {}", e);
                    continue;
                }
            };

            for rule in rules {
                let due = {
                    let states = self.states.lock().expect("state lock poisoned");
                    states
                        .get(&rule.id)
                        .map(|s| s.is_due(&rule, now))
                        .unwrap_or(true)
                };
                if !due || !self.begin_evaluation(rule.id) {
                    continue;
                }

                let engine = self.clone();
                self.tracker.spawn(async move {
                    // Queue behind the worker pool cap; a stuck query for
                    // one rule cannot stall the others.
                    let _permit = engine
                        .semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");

                    if let Err(e) = engine.evaluate_rule(&rule).await {
                        tracing::warn!(rule = %rule.name, "Evaluation failed: {}", e);
                    }
                    engine.finish_evaluation(rule.id);
                });
            }
        }
    }

    fn begin_evaluation(&self, rule_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(rule_id)
    }

    fn finish_evaluation(&self, rule_id: Uuid) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&rule_id);
    }

    /// One evaluation pass: query, decide, apply, snapshot.
    async fn evaluate_rule(&self, rule: &Rule) -> Result<(Option<f64>, EvalDecision)> {
        let outcome =
            match tokio::time::timeout(self.config.evaluation_timeout(), async {
                self.provider.query(&rule.expression).await
            })
            .await
            {
                Ok(Ok(v)) => QueryOutcome::Value(v),
                Ok(Err(e)) => QueryOutcome::Failed(e.to_string()),
                Err(_) => QueryOutcome::Failed(format!(
                    "metrics query timed out after {}s",
                    self.config.evaluation_timeout_secs
                )),
            };

        let value = match &outcome {
            QueryOutcome::Value(v) => Some(*v),
            QueryOutcome::Failed(_) => None,
        };

        let now = self.clock.now();
        let (decision, was_degraded) = {
            let mut states = self.states.lock().expect("state lock poisoned");
            let state = states.entry(rule.id).or_default();
            let was_degraded = state.degraded_alerted;
            let decision = decide(rule, state, outcome, now, self.config.failure_threshold);
            (decision, was_degraded)
        };

        if was_degraded && value.is_some() {
            self.resolve_degraded(rule, now).await;
        }

        match &decision {
            EvalDecision::None | EvalDecision::Pending | EvalDecision::Failed => {}
            EvalDecision::Fire { value } => self.apply_fire(rule, *value, now).await?,
            EvalDecision::Refresh { alert_id, value } => {
                self.apply_refresh(rule, *alert_id, *value, now).await?
            }
            EvalDecision::Resolve { alert_id } => self.apply_resolve(rule, *alert_id, now).await?,
            EvalDecision::Degraded { failures } => {
                self.apply_degraded(rule, *failures, now).await?
            }
        }

        self.snapshot_state(rule.id);
        Ok((value, decision))
    }

    /// Create a new alert, deduplicating against open alerts that share the
    /// fingerprint. The in-memory alert binding only advances after the row
    /// is durably written.
    async fn apply_fire(&self, rule: &Rule, value: f64, now: DateTime<Utc>) -> Result<()> {
        let fp = rule.fingerprint();

        if self.config.enable_deduplication {
            if let Some(existing) = self.alert_store.find_open_by_fingerprint(&fp).await? {
                match dedup_action(existing.created_at, now, self.config.deduplication_window()) {
                    DedupAction::Attach => {
                        self.alert_store.refresh_value(existing.id, value, now).await?;
                        self.bind_alert(rule.id, Some(existing.id));

                        let mut attached = existing;
                        attached.refresh(value, now);
                        tracing::debug!(rule = %rule.name, alert = %attached.id, "Deduplicated into open alert");
                        self.emit(&AlertEvent::Updated(attached));
                        return Ok(());
                    }
                    DedupAction::ResolveStaleAndCreate => {
                        if let Some(resolved) = self.alert_store.resolve(existing.id, now).await? {
                            self.emit(&AlertEvent::Resolved(resolved));
                        }
                    }
                }
            }
        }

        let alert = Alert::firing(rule, value, now);
        self.alert_store.create(&alert).await?;
        self.bind_alert(rule.id, Some(alert.id));

        tracing::warn!(
            rule = %rule.name,
            value = value,
            threshold = rule.threshold,
            severity = %rule.severity,
            "Alert triggered"
        );
        self.emit_created(alert, now);
        Ok(())
    }

    async fn apply_refresh(
        &self,
        rule: &Rule,
        alert_id: Uuid,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.alert_store.refresh_value(alert_id, value, now).await?;

        match self.alert_store.get(alert_id).await? {
            Some(alert) => self.emit(&AlertEvent::Updated(alert)),
            None => {
                // Row vanished (retention); drop the binding and refire next tick.
                self.bind_alert(rule.id, None);
            }
        }
        Ok(())
    }

    async fn apply_resolve(&self, rule: &Rule, alert_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let resolved = self.alert_store.resolve(alert_id, now).await?;
        self.bind_alert(rule.id, None);

        if let Some(alert) = resolved {
            tracing::info!(rule = %rule.name, alert = %alert.id, "Alert resolved");
            self.emit(&AlertEvent::Resolved(alert));
        }
        Ok(())
    }

    async fn apply_degraded(&self, rule: &Rule, failures: u32, now: DateTime<Utc>) -> Result<()> {
        let fp = degraded_fingerprint(rule.id);
        if self.alert_store.find_open_by_fingerprint(&fp).await?.is_some() {
            return Ok(());
        }

        let alert = degraded_alert(rule, failures, now);
        self.alert_store.create(&alert).await?;

        tracing::warn!(
            rule = %rule.name,
            failures = failures,
            "Rule evaluation degraded"
        );
        self.emit_created(alert, now);
        Ok(())
    }

    /// Resolve the internal degraded alert once the provider recovers.
    async fn resolve_degraded(&self, rule: &Rule, now: DateTime<Utc>) {
        let fp = degraded_fingerprint(rule.id);
        match self.alert_store.find_open_by_fingerprint(&fp).await {
            Ok(Some(open)) => match self.alert_store.resolve(open.id, now).await {
                Ok(Some(alert)) => self.emit(&AlertEvent::Resolved(alert)),
                Ok(None) => {}
                Err(e) => tracing::warn!(rule = %rule.name, "Failed to resolve degraded alert: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(rule = %rule.name, "Degraded alert lookup failed: {}", e),
        }
    }

    /// Advance the durable alert binding for a rule. Only called after the
    /// corresponding row write succeeded.
    fn bind_alert(&self, rule_id: Uuid, alert_id: Option<Uuid>) {
        let mut states = self.states.lock().expect("state lock poisoned");
        states.entry(rule_id).or_default().active_alert_id = alert_id;
    }

    fn snapshot_state(&self, rule_id: Uuid) {
        let snapshot = {
            let states = self.states.lock().expect("state lock poisoned");
            states.get(&rule_id).cloned()
        };
        if let Some(state) = snapshot {
            if let Ok(value) = serde_json::to_value(&state) {
                let ttl = self.config.evaluation_interval() * 4;
                self.cache.set(eval_state_key(rule_id), value, ttl);
            }
        }
    }

    /// Route a created alert through grouping when enabled.
    fn emit_created(&self, alert: Alert, now: DateTime<Utc>) {
        match self.groups {
            Some(ref groups) => groups.add(alert, now),
            None => self.emit(&AlertEvent::Created(alert)),
        }
    }

    fn emit(&self, event: &AlertEvent) {
        let sinks = self.sinks.read().expect("sink lock poisoned");
        for sink in sinks.iter() {
            sink.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::clock::SystemClock;
    use vigil_core::metrics::StaticProvider;
    use vigil_core::rule::ThresholdOp;

    fn engine() -> Arc<RulesEngine> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");

        RulesEngine::new(
            EngineConfig::default(),
            RuleStore::new(pool.clone()),
            AlertStore::new(pool),
            Arc::new(StaticProvider::new()),
            Arc::new(SystemClock),
            Arc::new(StateCache::new()),
        )
    }

    #[tokio::test]
    async fn test_start_is_not_reentrant() {
        let engine = engine();
        assert!(engine.start().is_ok());
        assert!(matches!(
            engine.start(),
            Err(VigilError::InvalidState(_))
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let engine = engine();
        assert!(engine.start().is_ok());
        engine.stop().await;
        assert!(!engine.is_running());
        assert!(matches!(engine.start(), Err(VigilError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_in_flight_guard_serializes_per_rule() {
        let engine = engine();
        let rule_id = Uuid::new_v4();

        assert!(engine.begin_evaluation(rule_id));
        // Second evaluation of the same rule is skipped, not queued twice.
        assert!(!engine.begin_evaluation(rule_id));
        // Other rules are unaffected.
        assert!(engine.begin_evaluation(Uuid::new_v4()));

        engine.finish_evaluation(rule_id);
        assert!(engine.begin_evaluation(rule_id));
    }

    #[test]
    fn test_dedup_action_window() {
        let now = Utc::now();
        let window = chrono::Duration::minutes(5);

        let recent = now - chrono::Duration::minutes(3);
        assert_eq!(dedup_action(recent, now, window), DedupAction::Attach);

        let boundary = now - window;
        assert_eq!(dedup_action(boundary, now, window), DedupAction::Attach);

        let stale = now - chrono::Duration::minutes(6);
        assert_eq!(
            dedup_action(stale, now, window),
            DedupAction::ResolveStaleAndCreate
        );
    }

    #[test]
    fn test_degraded_alert_shape() {
        let rule = Rule::new("db_up", "up", ThresholdOp::Lt, 1.0);
        let now = Utc::now();
        let alert = degraded_alert(&rule, 3, now);

        assert_eq!(alert.source, "vigil");
        assert_eq!(alert.severity, Severity::Info);
        assert_eq!(alert.rule_id, rule.id);
        assert_eq!(alert.fingerprint, degraded_fingerprint(rule.id));
        assert!(alert.message.contains("3 consecutive"));
        assert_eq!(alert.labels.get("rule_id"), Some(&rule.id.to_string()));
    }

    #[test]
    fn test_degraded_fingerprint_is_stable_per_rule() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(degraded_fingerprint(a), degraded_fingerprint(a));
        assert_ne!(degraded_fingerprint(a), degraded_fingerprint(b));
    }
}
