//! The hash chain that threads every event log row together.
//!
//! Mirrors the build/commit split of an append-only ledger: `build_row`
//! computes the next row against a given chain head without touching
//! storage, and `commit_row` re-derives the same material to confirm nothing
//! drifted between build and the write actually landing. Storage backends
//! call both inside the critical section described in the chain-head lock.

use crate::canonical::{hash as sha256, semantically_equal};
use crate::error::{LedgerError, LedgerResult};
use crate::types::{ChainHead, EventLogRow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Inputs needed to append one event; everything else is computed.
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub correlation_id: String,
    pub payload_json: Value,
    pub payload_canonical: Vec<u8>,
}

impl NewEvent {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(LedgerError::validation("event_type must not be empty"));
        }
        if self.aggregate_type.trim().is_empty() {
            return Err(LedgerError::validation("aggregate_type must not be empty"));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(LedgerError::validation("correlation_id must not be empty"));
        }
        if self.payload_canonical.is_empty() {
            return Err(LedgerError::validation("payload_canonical must not be empty"));
        }
        let parsed: Value = serde_json::from_slice(&self.payload_canonical)
            .map_err(|e| LedgerError::validation(format!("payload_canonical is not valid JSON: {e}")))?;
        if !semantically_equal(&parsed, &self.payload_json) {
            return Err(LedgerError::validation(
                "payload_canonical does not match payload_json",
            ));
        }
        Ok(())
    }
}

/// Build the next row given the current chain head. Pure; does not mutate
/// anything. The caller is responsible for holding the chain-head lock for
/// the duration between this call and `commit_row` succeeding in storage.
pub fn build_row(head: ChainHead, event: NewEvent, created_at: DateTime<Utc>) -> LedgerResult<EventLogRow> {
    event.validate()?;

    let seq = head.last_seq + 1;
    let payload_hash = sha256(&event.payload_canonical);
    let material = encode_material(
        seq,
        &head.last_hash,
        event.event_id,
        created_at,
        &event.event_type,
        &event.aggregate_type,
        &event.aggregate_id,
        &event.correlation_id,
        &payload_hash,
    );
    let hash = sha256(&material);

    Ok(EventLogRow {
        seq,
        event_id: event.event_id,
        event_type: event.event_type,
        aggregate_type: event.aggregate_type,
        aggregate_id: event.aggregate_id,
        correlation_id: event.correlation_id,
        payload_json: event.payload_json,
        payload_canonical: event.payload_canonical,
        payload_hash,
        prev_hash: head.last_hash,
        hash,
        created_at,
    })
}

/// Re-derive a row's hash against the chain head it claims to extend, to
/// confirm it is safe to persist (and to detect drift from a concurrent
/// appender that slipped past the lock).
pub fn verify_row_against_head(row: &EventLogRow, head: ChainHead) -> LedgerResult<()> {
    if row.seq != head.last_seq + 1 {
        return Err(LedgerError::IntegrityBreak {
            seq: row.seq,
            reason: "seq does not extend chain head".to_string(),
        });
    }
    if row.prev_hash != head.last_hash {
        return Err(LedgerError::IntegrityBreak {
            seq: row.seq,
            reason: "prev_hash does not match chain head".to_string(),
        });
    }
    let expected_payload_hash = sha256(&row.payload_canonical);
    if row.payload_hash != expected_payload_hash {
        return Err(LedgerError::IntegrityBreak {
            seq: row.seq,
            reason: "payload_hash mismatch".to_string(),
        });
    }
    let material = encode_material(
        row.seq,
        &row.prev_hash,
        row.event_id,
        row.created_at,
        &row.event_type,
        &row.aggregate_type,
        &row.aggregate_id,
        &row.correlation_id,
        &row.payload_hash,
    );
    if row.hash != sha256(&material) {
        return Err(LedgerError::IntegrityBreak {
            seq: row.seq,
            reason: "hash mismatch".to_string(),
        });
    }
    Ok(())
}

fn lp(field: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(field.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(field);
}

#[allow(clippy::too_many_arguments)]
fn encode_material(
    seq: i64,
    prev_hash: &[u8; 32],
    event_id: Uuid,
    created_at: DateTime<Utc>,
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    correlation_id: &str,
    payload_hash: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::new();
    lp(seq.to_string().as_bytes(), &mut out);
    if seq == 1 {
        lp(b"", &mut out);
    } else {
        lp(hex::encode(prev_hash).as_bytes(), &mut out);
    }
    lp(event_id.to_string().as_bytes(), &mut out);
    lp(
        created_at
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            .as_bytes(),
        &mut out,
    );
    lp(event_type.as_bytes(), &mut out);
    lp(aggregate_type.as_bytes(), &mut out);
    lp(aggregate_id.as_bytes(), &mut out);
    lp(correlation_id.as_bytes(), &mut out);
    lp(hex::encode(payload_hash).as_bytes(), &mut out);
    out
}

/// Compute the `hash` field for an already-populated row, used by the
/// verifier to recompute from persisted material without rebuilding it.
pub fn recompute_hash(row: &EventLogRow) -> [u8; 32] {
    let material = encode_material(
        row.seq,
        &row.prev_hash,
        row.event_id,
        row.created_at,
        &row.event_type,
        &row.aggregate_type,
        &row.aggregate_id,
        &row.correlation_id,
        &row.payload_hash,
    );
    sha256(&material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> NewEvent {
        let payload = json!({"k": "v"});
        NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "TEST_EVENT".to_string(),
            aggregate_type: "TEST".to_string(),
            aggregate_id: "agg-1".to_string(),
            correlation_id: "corr-1".to_string(),
            payload_json: payload.clone(),
            payload_canonical: serde_json::to_vec(&payload).unwrap(),
        }
    }

    #[test]
    fn first_row_has_empty_prev_hash() {
        let row = build_row(ChainHead::genesis(), sample_event(), Utc::now()).unwrap();
        assert_eq!(row.seq, 1);
        assert_eq!(row.prev_hash, [0u8; 32]);
    }

    #[test]
    fn chained_rows_link_by_hash() {
        let row1 = build_row(ChainHead::genesis(), sample_event(), Utc::now()).unwrap();
        let head = ChainHead {
            last_seq: row1.seq,
            last_hash: row1.hash,
        };
        let row2 = build_row(head, sample_event(), Utc::now()).unwrap();
        assert_eq!(row2.seq, 2);
        assert_eq!(row2.prev_hash, row1.hash);
        assert!(verify_row_against_head(&row2, head).is_ok());
    }

    #[test]
    fn rejects_empty_event_type() {
        let mut event = sample_event();
        event.event_type = "  ".to_string();
        assert!(build_row(ChainHead::genesis(), event, Utc::now()).is_err());
    }

    #[test]
    fn rejects_payload_canonical_mismatching_payload_json() {
        let mut event = sample_event();
        event.payload_json = json!({"k": "tampered"});
        assert!(build_row(ChainHead::genesis(), event, Utc::now()).is_err());
    }

    #[test]
    fn tampering_with_payload_breaks_verification() {
        let mut row = build_row(ChainHead::genesis(), sample_event(), Utc::now()).unwrap();
        row.payload_json = json!({"k": "tampered"});
        row.payload_canonical = serde_json::to_vec(&row.payload_json).unwrap();
        let head = ChainHead::genesis();
        assert!(verify_row_against_head(&row, head).is_err());
    }
}
