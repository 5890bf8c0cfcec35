//! Rules engine: scheduled evaluation and alert lifecycle.

mod evaluator;
mod grouping;
mod sink;

pub use evaluator::{EvalReport, RulesEngine};
pub use grouping::{GroupBuffer, GroupKey};
pub use sink::{AlertEvent, AlertSink, FnSink, QueueSink};
