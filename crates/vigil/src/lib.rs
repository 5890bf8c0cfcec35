//! VIGIL: control-center alert manager.
//!
//! Single binary runtime that provides:
//! - Scheduled rule evaluation against a metrics provider
//! - Alert lifecycle with deduplication and grouping
//! - Multi-channel notification fan-out with retries and batching
//! - Hash-chained append-only audit ledger
//! - HTTP API for rules, channels, alerts, and audit queries

pub mod cli;
pub mod runtime;

pub use runtime::{Vigil, VigilBuilder};
