use serde::Serialize;
use uuid::Uuid;

use vigil_core::audit::{AuditEntry, GENESIS_HASH};

/// Kinds of integrity violations the chain can exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperKind {
    /// Recomputed hash differs from the stored hash.
    HashMismatch,
    /// Entry's previous_hash does not commit to the preceding entry.
    ChainBreak,
    /// Entry's timestamp precedes the preceding entry's timestamp.
    TimestampAnomaly,
}

impl std::fmt::Display for TamperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TamperKind::HashMismatch => write!(f, "hash_mismatch"),
            TamperKind::ChainBreak => write!(f, "chain_break"),
            TamperKind::TimestampAnomaly => write!(f, "timestamp_anomaly"),
        }
    }
}

/// One integrity finding anchored to an entry.
#[derive(Debug, Clone, Serialize)]
pub struct TamperFinding {
    pub entry_id: Uuid,
    /// Position within the verified range.
    pub index: usize,
    pub kind: TamperKind,
    pub detail: String,
}

/// Result of verifying a chain range.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub verified: bool,
    pub entries_checked: usize,
    pub findings: Vec<TamperFinding>,
}

/// Verify a contiguous range of the ledger, ordered by (timestamp, id).
///
/// `preceding` is the entry immediately before the range, when the range
/// does not start at genesis; it anchors the first link. Chain links are
/// checked against the *recomputed* hash of the predecessor, so a mutated
/// entry surfaces both as its own hash mismatch and as a chain break on its
/// successor.
pub fn verify_chain(entries: &[AuditEntry], preceding: Option<&AuditEntry>) -> ChainReport {
    let mut findings = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        if !entry.is_self_consistent() {
            findings.push(TamperFinding {
                entry_id: entry.id,
                index,
                kind: TamperKind::HashMismatch,
                detail: format!("stored hash does not match entry content for {}", entry.id),
            });
        }

        let predecessor = if index == 0 {
            preceding
        } else {
            Some(&entries[index - 1])
        };

        match predecessor {
            Some(prev) => {
                if entry.previous_hash != prev.compute_hash() {
                    findings.push(TamperFinding {
                        entry_id: entry.id,
                        index,
                        kind: TamperKind::ChainBreak,
                        detail: format!(
                            "previous_hash does not commit to preceding entry {}",
                            prev.id
                        ),
                    });
                }
                if entry.timestamp < prev.timestamp {
                    findings.push(TamperFinding {
                        entry_id: entry.id,
                        index,
                        kind: TamperKind::TimestampAnomaly,
                        detail: format!(
                            "timestamp {} precedes predecessor's {}",
                            entry.timestamp, prev.timestamp
                        ),
                    });
                }
            }
            None => {
                // Range starts at the beginning of the ledger: the first
                // entry must be genesis.
                if entry.previous_hash != GENESIS_HASH {
                    findings.push(TamperFinding {
                        entry_id: entry.id,
                        index,
                        kind: TamperKind::ChainBreak,
                        detail: "first ledger entry does not carry the zero genesis hash"
                            .to_string(),
                    });
                }
            }
        }
    }

    ChainReport {
        verified: findings.is_empty(),
        entries_checked: entries.len(),
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vigil_core::audit::{AuditActor, AuditEvent, AuditEventType};

    fn chain(len: usize) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = Vec::new();
        let t0 = Utc::now();

        for i in 0..len {
            let event = AuditEvent::new(
                AuditEventType::ParamUpdate,
                AuditActor::new("u-1", "admin@example.com", "admin"),
                format!("update-{}", i),
                "params",
                format!("key-{}", i),
            );
            let previous_hash = entries.last().map(|e: &AuditEntry| e.hash).unwrap_or(GENESIS_HASH);
            entries.push(AuditEntry::from_event(
                event,
                Uuid::new_v4(),
                t0 + Duration::seconds(i as i64),
                previous_hash,
            ));
        }

        entries
    }

    #[test]
    fn test_untampered_chain_verifies() {
        let entries = chain(5);
        let report = verify_chain(&entries, None);
        assert!(report.verified);
        assert_eq!(report.entries_checked, 5);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_empty_range_verifies() {
        let report = verify_chain(&[], None);
        assert!(report.verified);
        assert_eq!(report.entries_checked, 0);
    }

    #[test]
    fn test_mutated_entry_yields_mismatch_and_break() {
        let mut entries = chain(4);
        entries[1].action = "tampered".to_string();

        let report = verify_chain(&entries, None);
        assert!(!report.verified);

        let on_mutated: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.index == 1)
            .map(|f| f.kind)
            .collect();
        assert_eq!(on_mutated, vec![TamperKind::HashMismatch]);

        let on_next: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.index == 2)
            .map(|f| f.kind)
            .collect();
        assert_eq!(on_next, vec![TamperKind::ChainBreak]);

        // Entries past the successor are untouched.
        assert!(report.findings.iter().all(|f| f.index <= 2));
    }

    #[test]
    fn test_broken_link_without_mutation() {
        let mut entries = chain(3);
        entries[2].previous_hash = [9u8; 32];
        // Recompute the hash so the entry is self-consistent but unlinked.
        entries[2].hash = entries[2].compute_hash();

        let report = verify_chain(&entries, None);
        let kinds: Vec<_> = report.findings.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![TamperKind::ChainBreak]);
    }

    #[test]
    fn test_timestamp_anomaly() {
        let mut entries = chain(3);
        entries[2].timestamp = entries[1].timestamp - Duration::seconds(10);
        entries[2].hash = entries[2].compute_hash();

        let report = verify_chain(&entries, None);
        let kinds: Vec<_> = report.findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&TamperKind::TimestampAnomaly));
    }

    #[test]
    fn test_range_anchored_on_preceding_entry() {
        let entries = chain(5);
        let (head, tail) = entries.split_at(2);

        // Without the anchor the first tail entry looks like a bad genesis.
        let unanchored = verify_chain(tail, None);
        assert!(!unanchored.verified);

        let anchored = verify_chain(tail, Some(&head[1]));
        assert!(anchored.verified);
    }

    #[test]
    fn test_non_genesis_first_entry_detected() {
        let entries = chain(3);
        let report = verify_chain(&entries[1..], None);
        assert!(!report.verified);
        assert_eq!(report.findings[0].kind, TamperKind::ChainBreak);
    }
}
