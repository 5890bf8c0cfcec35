use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule::Rule;

/// Per-rule evaluation bookkeeping.
///
/// Owned exclusively by the rule's evaluation worker; snapshots may be cached
/// but the store-backed alert rows are the durable source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalState {
    pub last_value: Option<f64>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// When the rule first started violating; None while healthy.
    pub violating_since: Option<DateTime<Utc>>,
    /// Open alert owned by this rule, if any.
    pub active_alert_id: Option<Uuid>,
    pub consecutive_failures: u32,
    /// Whether the degraded alert for the current failure streak was emitted.
    pub degraded_alerted: bool,
}

impl EvalState {
    /// Whether the rule is due given its own interval and the last run.
    pub fn is_due(&self, rule: &Rule, now: DateTime<Utc>) -> bool {
        if rule.interval_secs == 0 {
            return true;
        }
        match self.last_evaluated_at {
            None => true,
            Some(last) => now - last >= chrono::Duration::seconds(rule.interval_secs as i64),
        }
    }
}

/// Outcome of one metrics provider query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Value(f64),
    Failed(String),
}

/// What the engine must do after one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalDecision {
    /// Healthy and no open alert; nothing to persist.
    None,
    /// Violating but the for-duration has not elapsed yet.
    Pending,
    /// Violation held long enough and no alert is open: create one
    /// (subject to deduplication, decided by the caller against the store).
    Fire { value: f64 },
    /// Violation continues on an open alert: refresh its observed value.
    Refresh { alert_id: Uuid, value: f64 },
    /// Rule recovered while an alert is open: resolve it.
    Resolve { alert_id: Uuid },
    /// The metrics provider failed this many times in a row; the degraded
    /// notice should be emitted once per streak.
    Degraded { failures: u32 },
    /// Provider failed but below the degraded threshold.
    Failed,
}

/// One evaluation step of the rule state machine.
///
/// Mutates the ephemeral fields of `state` (value, stamps, violation window,
/// failure counters). It never touches `active_alert_id`: the caller advances
/// that only after the corresponding alert row was persisted, so a storage
/// failure leaves the machine ready to retry on the next tick.
pub fn decide(
    rule: &Rule,
    state: &mut EvalState,
    outcome: QueryOutcome,
    now: DateTime<Utc>,
    failure_threshold: u32,
) -> EvalDecision {
    state.last_evaluated_at = Some(now);

    let value = match outcome {
        QueryOutcome::Value(v) => {
            if state.consecutive_failures > 0 {
                state.consecutive_failures = 0;
                state.degraded_alerted = false;
            }
            v
        }
        QueryOutcome::Failed(_) => {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.consecutive_failures >= failure_threshold && !state.degraded_alerted {
                state.degraded_alerted = true;
                return EvalDecision::Degraded {
                    failures: state.consecutive_failures,
                };
            }
            return EvalDecision::Failed;
        }
    };

    state.last_value = Some(value);
    let violating = rule.operator.evaluate(value, rule.threshold);

    if violating {
        let since = *state.violating_since.get_or_insert(now);

        if now - since >= rule.for_duration() {
            match state.active_alert_id {
                Some(alert_id) => EvalDecision::Refresh { alert_id, value },
                None => EvalDecision::Fire { value },
            }
        } else {
            EvalDecision::Pending
        }
    } else {
        state.violating_since = None;
        match state.active_alert_id {
            Some(alert_id) => EvalDecision::Resolve { alert_id },
            None => EvalDecision::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Severity, ThresholdOp};

    fn rule(for_duration_secs: u64) -> Rule {
        Rule::new("cpu_high", "cpu_usage", ThresholdOp::Gt, 80.0)
            .with_severity(Severity::Warning)
            .with_for_duration(for_duration_secs)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_zero_for_duration_fires_immediately() {
        let r = rule(0);
        let mut state = EvalState::default();
        let now = Utc::now();

        let decision = decide(&r, &mut state, QueryOutcome::Value(85.0), now, 3);
        assert_eq!(decision, EvalDecision::Fire { value: 85.0 });
        assert_eq!(state.violating_since, Some(now));
    }

    #[test]
    fn test_for_duration_gates_firing() {
        // gt 80 with for_duration 30s; 85 observed at t=0, t=20, t=30
        let r = rule(30);
        let mut state = EvalState::default();
        let t0 = Utc::now();

        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0, 3);
        assert_eq!(d, EvalDecision::Pending);

        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(20), 3);
        assert_eq!(d, EvalDecision::Pending);

        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(30), 3);
        assert_eq!(d, EvalDecision::Fire { value: 85.0 });
    }

    #[test]
    fn test_open_alert_is_refreshed_then_resolved() {
        let r = rule(0);
        let mut state = EvalState::default();
        let t0 = Utc::now();
        let alert_id = Uuid::new_v4();

        assert_eq!(
            decide(&r, &mut state, QueryOutcome::Value(85.0), t0, 3),
            EvalDecision::Fire { value: 85.0 }
        );
        // Caller persisted the alert row, then advanced the state.
        state.active_alert_id = Some(alert_id);

        let d = decide(&r, &mut state, QueryOutcome::Value(90.0), t0 + secs(60), 3);
        assert_eq!(d, EvalDecision::Refresh { alert_id, value: 90.0 });

        let d = decide(&r, &mut state, QueryOutcome::Value(50.0), t0 + secs(90), 3);
        assert_eq!(d, EvalDecision::Resolve { alert_id });
        assert_eq!(state.violating_since, None);
    }

    #[test]
    fn test_recovery_without_alert_is_silent() {
        let r = rule(30);
        let mut state = EvalState::default();
        let t0 = Utc::now();

        decide(&r, &mut state, QueryOutcome::Value(85.0), t0, 3);
        let d = decide(&r, &mut state, QueryOutcome::Value(50.0), t0 + secs(10), 3);
        assert_eq!(d, EvalDecision::None);
        assert_eq!(state.violating_since, None);
    }

    #[test]
    fn test_violation_window_restarts_after_recovery() {
        let r = rule(30);
        let mut state = EvalState::default();
        let t0 = Utc::now();

        decide(&r, &mut state, QueryOutcome::Value(85.0), t0, 3);
        decide(&r, &mut state, QueryOutcome::Value(50.0), t0 + secs(10), 3);

        // A fresh violation starts a fresh window; 29s in, still pending.
        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(20), 3);
        assert_eq!(d, EvalDecision::Pending);
        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(49), 3);
        assert_eq!(d, EvalDecision::Pending);
        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(50), 3);
        assert_eq!(d, EvalDecision::Fire { value: 85.0 });
    }

    #[test]
    fn test_provider_failures_never_create_alerts() {
        let r = rule(0);
        let mut state = EvalState::default();
        let t0 = Utc::now();

        for i in 0..10 {
            let d = decide(
                &r,
                &mut state,
                QueryOutcome::Failed("connection refused".to_string()),
                t0 + secs(i),
                3,
            );
            assert!(!matches!(d, EvalDecision::Fire { .. }));
        }
        assert_eq!(state.violating_since, None);
        assert_eq!(state.consecutive_failures, 10);
    }

    #[test]
    fn test_degraded_emitted_once_and_resets_on_recovery() {
        let r = rule(0);
        let mut state = EvalState::default();
        let t0 = Utc::now();
        let fail = || QueryOutcome::Failed("timeout".to_string());

        assert_eq!(decide(&r, &mut state, fail(), t0, 3), EvalDecision::Failed);
        assert_eq!(decide(&r, &mut state, fail(), t0 + secs(1), 3), EvalDecision::Failed);
        assert_eq!(
            decide(&r, &mut state, fail(), t0 + secs(2), 3),
            EvalDecision::Degraded { failures: 3 }
        );
        // Only once per streak.
        assert_eq!(decide(&r, &mut state, fail(), t0 + secs(3), 3), EvalDecision::Failed);

        // Recovery resets the counter and re-arms the notice.
        decide(&r, &mut state, QueryOutcome::Value(10.0), t0 + secs(4), 3);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.degraded_alerted);
    }

    #[test]
    fn test_failure_preserves_violation_window() {
        let r = rule(30);
        let mut state = EvalState::default();
        let t0 = Utc::now();

        decide(&r, &mut state, QueryOutcome::Value(85.0), t0, 3);
        decide(
            &r,
            &mut state,
            QueryOutcome::Failed("blip".to_string()),
            t0 + secs(10),
            3,
        );
        assert_eq!(state.violating_since, Some(t0));

        let d = decide(&r, &mut state, QueryOutcome::Value(85.0), t0 + secs(30), 3);
        assert_eq!(d, EvalDecision::Fire { value: 85.0 });
    }

    #[test]
    fn test_is_due_honors_rule_interval() {
        let mut r = rule(0);
        r.interval_secs = 60;
        let now = Utc::now();

        let mut state = EvalState::default();
        assert!(state.is_due(&r, now));

        state.last_evaluated_at = Some(now - secs(30));
        assert!(!state.is_due(&r, now));

        state.last_evaluated_at = Some(now - secs(60));
        assert!(state.is_due(&r, now));
    }
}
