use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use vigil_core::alert::Alert;
use vigil_core::rule::Severity;

/// Key under which alerts are grouped for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub source: String,
    pub severity: Severity,
}

impl GroupKey {
    pub fn of(alert: &Alert) -> Self {
        Self {
            source: alert.source.clone(),
            severity: alert.severity,
        }
    }
}

struct Window {
    opened_at: DateTime<Utc>,
    alerts: Vec<Alert>,
}

/// Collects created alerts into per-(source, severity) windows.
///
/// A window opens when its first member arrives and flushes one window
/// length later. Later members never extend the window; it resets only on
/// flush.
pub struct GroupBuffer {
    window: Duration,
    windows: Mutex<HashMap<GroupKey, Window>>,
}

impl GroupBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Add an alert to its group window, opening one if needed.
    pub fn add(&self, alert: Alert, now: DateTime<Utc>) {
        let key = GroupKey::of(&alert);
        let mut windows = self.windows.lock().expect("group lock poisoned");

        windows
            .entry(key)
            .or_insert_with(|| Window {
                opened_at: now,
                alerts: Vec::new(),
            })
            .alerts
            .push(alert);
    }

    /// Flush windows whose length has elapsed, returning their members.
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<(GroupKey, Vec<Alert>)> {
        let mut windows = self.windows.lock().expect("group lock poisoned");

        let due: Vec<GroupKey> = windows
            .iter()
            .filter(|(_, w)| now - w.opened_at >= self.window)
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| windows.remove(&key).map(|w| (key, w.alerts)))
            .collect()
    }

    /// Flush everything regardless of age (shutdown path).
    pub fn flush_all(&self) -> Vec<(GroupKey, Vec<Alert>)> {
        let mut windows = self.windows.lock().expect("group lock poisoned");
        windows.drain().map(|(k, w)| (k, w.alerts)).collect()
    }

    /// Number of open windows.
    pub fn open_windows(&self) -> usize {
        self.windows.lock().expect("group lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::rule::{Rule, ThresholdOp};

    fn alert(source: &str, severity: Severity) -> Alert {
        let rule = Rule::new("r", "expr", ThresholdOp::Gt, 1.0)
            .with_source(source)
            .with_severity(severity);
        Alert::firing(&rule, 2.0, Utc::now())
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn test_groups_by_source_and_severity() {
        let buffer = GroupBuffer::new(secs(30));
        let t0 = Utc::now();

        buffer.add(alert("gateway", Severity::Critical), t0);
        buffer.add(alert("gateway", Severity::Critical), t0 + secs(5));
        buffer.add(alert("gateway", Severity::Warning), t0 + secs(5));
        buffer.add(alert("storage", Severity::Critical), t0 + secs(5));

        assert_eq!(buffer.open_windows(), 3);

        let flushed = buffer.flush_due(t0 + secs(30));
        // Only the window opened at t0 is due.
        assert_eq!(flushed.len(), 1);
        let (key, alerts) = &flushed[0];
        assert_eq!(key.source, "gateway");
        assert_eq!(key.severity, Severity::Critical);
        assert_eq!(alerts.len(), 2);
    }

    #[test]
    fn test_window_not_extended_by_new_members() {
        let buffer = GroupBuffer::new(secs(30));
        let t0 = Utc::now();

        buffer.add(alert("gateway", Severity::Critical), t0);
        // Arrives late in the window; must not push the flush out.
        buffer.add(alert("gateway", Severity::Critical), t0 + secs(29));

        let flushed = buffer.flush_due(t0 + secs(30));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 2);
    }

    #[test]
    fn test_window_resets_on_flush_only() {
        let buffer = GroupBuffer::new(secs(30));
        let t0 = Utc::now();

        buffer.add(alert("gateway", Severity::Critical), t0);
        assert!(buffer.flush_due(t0 + secs(29)).is_empty());
        assert_eq!(buffer.flush_due(t0 + secs(30)).len(), 1);

        // A new member after the flush opens a fresh window.
        buffer.add(alert("gateway", Severity::Critical), t0 + secs(40));
        assert!(buffer.flush_due(t0 + secs(60)).is_empty());
        assert_eq!(buffer.flush_due(t0 + secs(70)).len(), 1);
    }

    #[test]
    fn test_flush_all_drains_everything() {
        let buffer = GroupBuffer::new(secs(300));
        let t0 = Utc::now();

        buffer.add(alert("a", Severity::Info), t0);
        buffer.add(alert("b", Severity::Info), t0);

        let flushed = buffer.flush_all();
        assert_eq!(flushed.len(), 2);
        assert_eq!(buffer.open_windows(), 0);
    }
}
