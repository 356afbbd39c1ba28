//! Online and offline chain verification. The online path reads directly
//! from a storage backend; the offline path operates on an exported manifest
//! so an external binary can verify a dump with no database access at all.

use crate::canonical::semantically_equal;
use crate::chain::recompute_hash;
use crate::error::LedgerResult;
use crate::storage::LedgerStorage;
use crate::types::{ChainHead, EventLogRow};
use serde::{Deserialize, Serialize};

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub break_seq: Option<i64>,
    pub reason: Option<String>,
    pub head_seq: i64,
    pub head_hash: String,
    pub count: usize,
}

impl VerifyReport {
    fn break_at(seq: i64, reason: impl Into<String>, count: usize) -> Self {
        Self {
            ok: false,
            break_seq: Some(seq),
            reason: Some(reason.into()),
            head_seq: 0,
            head_hash: String::new(),
            count,
        }
    }

    fn ok(head_seq: i64, head_hash: [u8; 32], count: usize) -> Self {
        Self {
            ok: true,
            break_seq: None,
            reason: None,
            head_seq,
            head_hash: hex::encode(head_hash),
            count,
        }
    }
}

/// Minimal export row: enough to check `seq` monotonicity and the
/// `prev_hash(i) == hash(i-1)` link, but not enough to recompute `hash` from
/// scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimalRow {
    pub seq: i64,
    pub prev_hash: String,
    pub hash: String,
}

/// Fully verify the chain as currently persisted in `storage`, cross-checked
/// against the persisted chain-head singleton so a tampered or rolled-back
/// head row is caught even though every exported event row is internally
/// consistent.
pub async fn verify_chain(storage: &dyn LedgerStorage) -> LedgerResult<VerifyReport> {
    let rows = storage.export_events().await?;
    let head = storage.read_chain_head().await?;
    Ok(verify_strong(&rows, head))
}

/// Strong check: recomputes every `payload_hash` and `hash` from the
/// persisted material (§4.7 checks 1-7), then checks the loop's final state
/// against the persisted chain head (§4.7 after-loop checks).
pub fn verify_strong(rows: &[EventLogRow], head: ChainHead) -> VerifyReport {
    let mut prev = [0u8; 32];
    let mut last_seq = 0i64;

    for row in rows {
        if row.seq != last_seq + 1 {
            return VerifyReport::break_at(row.seq, "bad seq", rows.len());
        }
        if row.prev_hash != prev {
            return VerifyReport::break_at(row.seq, "prev_hash mismatch", rows.len());
        }
        if row.payload_canonical.is_empty() {
            return VerifyReport::break_at(row.seq, "payload_canonical empty", rows.len());
        }
        let parsed: serde_json::Value = match serde_json::from_slice(&row.payload_canonical) {
            Ok(v) => v,
            Err(_) => {
                return VerifyReport::break_at(
                    row.seq,
                    "payload_canonical is not valid JSON",
                    rows.len(),
                )
            }
        };
        if !semantically_equal(&parsed, &row.payload_json) {
            return VerifyReport::break_at(
                row.seq,
                "payload_canonical != payload_json",
                rows.len(),
            );
        }
        let expected_payload_hash = crate::canonical::hash(&row.payload_canonical);
        if row.payload_hash != expected_payload_hash {
            return VerifyReport::break_at(row.seq, "payload_hash mismatch", rows.len());
        }
        if row.hash != recompute_hash(row) {
            return VerifyReport::break_at(row.seq, "hash mismatch", rows.len());
        }

        prev = row.hash;
        last_seq = row.seq;
    }

    if last_seq != head.last_seq {
        return VerifyReport::break_at(last_seq, "head last_seq mismatch", rows.len());
    }
    if !rows.is_empty() && prev != head.last_hash {
        return VerifyReport::break_at(last_seq, "head last_hash mismatch", rows.len());
    }

    VerifyReport::ok(last_seq, prev, rows.len())
}

/// Minimal check: only `seq` monotonicity and the hash-link, for a caller
/// that received a partial export with no material to recompute from.
pub fn verify_minimal(rows: &[MinimalRow]) -> VerifyReport {
    let mut prev = String::new();
    let mut last_seq = 0i64;

    for row in rows {
        if row.seq != last_seq + 1 {
            return VerifyReport::break_at(row.seq, "bad seq", rows.len());
        }
        if row.prev_hash != prev {
            return VerifyReport::break_at(row.seq, "prev_hash mismatch", rows.len());
        }
        prev = row.hash.clone();
        last_seq = row.seq;
    }

    VerifyReport {
        ok: true,
        break_seq: None,
        reason: None,
        head_seq: last_seq,
        head_hash: prev,
        count: rows.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{build_row, NewEvent};
    use crate::types::ChainHead;
    use serde_json::json;
    use uuid::Uuid;

    fn event(n: u32) -> NewEvent {
        let payload = json!({"n": n});
        NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "TEST".to_string(),
            aggregate_type: "TEST".to_string(),
            aggregate_id: format!("agg-{n}"),
            correlation_id: "corr".to_string(),
            payload_json: payload.clone(),
            payload_canonical: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn build_chain(n: u32) -> (Vec<EventLogRow>, ChainHead) {
        let mut head = ChainHead::genesis();
        let mut rows = Vec::new();
        for i in 0..n {
            let row = build_row(head, event(i), chrono::Utc::now()).unwrap();
            head = ChainHead {
                last_seq: row.seq,
                last_hash: row.hash,
            };
            rows.push(row);
        }
        (rows, head)
    }

    #[test]
    fn verifies_a_clean_chain() {
        let (rows, head) = build_chain(5);
        let report = verify_strong(&rows, head);
        assert!(report.ok);
        assert_eq!(report.count, 5);
    }

    #[test]
    fn detects_tampered_payload() {
        let (mut rows, head) = build_chain(3);
        rows[1].payload_json = json!({"n": 999});
        rows[1].payload_canonical = serde_json::to_vec(&rows[1].payload_json).unwrap();
        let report = verify_strong(&rows, head);
        assert!(!report.ok);
        assert_eq!(report.break_seq, Some(2));
    }

    #[test]
    fn detects_broken_prev_hash_link() {
        let (mut rows, head) = build_chain(3);
        rows[2].prev_hash = [7u8; 32];
        let report = verify_strong(&rows, head);
        assert!(!report.ok);
        assert_eq!(report.break_seq, Some(3));
    }

    #[test]
    fn detects_seq_gap() {
        let (mut rows, head) = build_chain(3);
        rows.remove(1);
        let report = verify_strong(&rows, head);
        assert!(!report.ok);
        assert_eq!(report.break_seq, Some(3));
    }

    #[test]
    fn detects_rolled_back_chain_head() {
        let (rows, _) = build_chain(3);
        let stale_head = ChainHead {
            last_seq: 2,
            last_hash: rows[1].hash,
        };
        let report = verify_strong(&rows, stale_head);
        assert!(!report.ok);
        assert_eq!(report.reason.as_deref(), Some("head last_seq mismatch"));
    }

    #[test]
    fn detects_tampered_chain_head_hash() {
        let (rows, mut head) = build_chain(3);
        head.last_hash = [9u8; 32];
        let report = verify_strong(&rows, head);
        assert!(!report.ok);
        assert_eq!(report.reason.as_deref(), Some("head last_hash mismatch"));
    }

    #[test]
    fn minimal_check_follows_hash_chain() {
        let (rows, _) = build_chain(3);
        let minimal: Vec<MinimalRow> = rows
            .iter()
            .map(|r| MinimalRow {
                seq: r.seq,
                prev_hash: hex::encode(r.prev_hash),
                hash: hex::encode(r.hash),
            })
            .collect();
        let report = verify_minimal(&minimal);
        assert!(report.ok);
    }
}
