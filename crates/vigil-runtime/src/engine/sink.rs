use tokio::sync::mpsc;

use vigil_core::alert::Alert;

/// Alert lifecycle events emitted by the rules engine.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    /// A new alert entered the active state.
    Created(Alert),
    /// An open alert was refreshed (value bump or dedup attach).
    Updated(Alert),
    /// An alert was resolved, automatically or by admin action.
    Resolved(Alert),
    /// A flushed grouping window: all alerts created in the window that
    /// share (source, severity), delivered as one event.
    Grouped { alerts: Vec<Alert> },
}

impl AlertEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::Created(_) => "created",
            AlertEvent::Updated(_) => "updated",
            AlertEvent::Resolved(_) => "resolved",
            AlertEvent::Grouped { .. } => "grouped",
        }
    }
}

/// Sink for alert lifecycle events.
///
/// The engine invokes sinks synchronously from the evaluating worker;
/// implementations that need to decouple should forward to a queue
/// (see [`QueueSink`]).
pub trait AlertSink: Send + Sync {
    fn on_event(&self, event: &AlertEvent);
}

/// Adapter turning a closure into a sink.
pub struct FnSink<F: Fn(&AlertEvent) + Send + Sync>(pub F);

impl<F: Fn(&AlertEvent) + Send + Sync> AlertSink for FnSink<F> {
    fn on_event(&self, event: &AlertEvent) {
        (self.0)(event)
    }
}

/// Sink that forwards events into an unbounded queue, decoupling slow
/// consumers (like the dispatcher) from evaluation workers.
pub struct QueueSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl QueueSink {
    /// Create the sink and the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for QueueSink {
    fn on_event(&self, event: &AlertEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::warn!(kind = event.kind(), "Alert event dropped: queue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::rule::{Rule, ThresholdOp};

    fn alert() -> Alert {
        let rule = Rule::new("r", "expr", ThresholdOp::Gt, 1.0);
        Alert::firing(&rule, 2.0, Utc::now())
    }

    #[test]
    fn test_fn_sink() {
        let count = std::sync::atomic::AtomicUsize::new(0);
        let sink = FnSink(|_: &AlertEvent| {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        sink.on_event(&AlertEvent::Created(alert()));
        sink.on_event(&AlertEvent::Resolved(alert()));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_sink_forwards() {
        let (sink, mut rx) = QueueSink::channel();

        sink.on_event(&AlertEvent::Created(alert()));
        sink.on_event(&AlertEvent::Updated(alert()));

        assert_eq!(rx.recv().await.unwrap().kind(), "created");
        assert_eq!(rx.recv().await.unwrap().kind(), "updated");
    }

    #[test]
    fn test_queue_sink_survives_closed_receiver() {
        let (sink, rx) = QueueSink::channel();
        drop(rx);
        // Must not panic.
        sink.on_event(&AlertEvent::Created(alert()));
    }
}
