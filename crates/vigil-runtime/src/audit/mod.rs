//! Append-only audit ledger with cryptographic chain verification.

mod export;
mod ledger;
mod verify;

pub use export::{export, export_csv, export_json, ExportFormat, EXPORT_FIELDS};
pub use ledger::{AuditLedger, AuditQuery, AuditStats};
pub use verify::{verify_chain, ChainReport, TamperFinding, TamperKind};
