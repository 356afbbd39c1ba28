//! Domain types for the ledger: accounts, transactions, entries, idempotency
//! anchors, event log rows, the chain head, and risk snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Direction of a ledger entry within a balanced transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryDirection {
    Debit,
    Credit,
}

/// An account. Created by the runtime; never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub label: String,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(label: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            account_id: Uuid::new_v4(),
            label: label.into(),
            currency: currency.into(),
            created_at: Utc::now(),
        }
    }
}

/// A posted transfer. Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTx {
    pub tx_id: Uuid,
    pub external_ref: String,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// One side of a balanced transfer. Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub tx_id: Uuid,
    pub account_id: Uuid,
    pub direction: EntryDirection,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Idempotency anchor state. `Committed` is terminal and frozen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Reserved,
    Committed,
}

/// Anchors a request by `(idempotency_key, request_hash)` so retries are safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyAnchor {
    pub idempotency_key: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub tx_id: Option<Uuid>,
    pub response_canonical: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// A row in the append-only hash-chained event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRow {
    pub seq: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub correlation_id: String,
    pub payload_json: Value,
    pub payload_canonical: Vec<u8>,
    pub payload_hash: [u8; 32],
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
    pub created_at: DateTime<Utc>,
}

/// Singleton row tracking the last appended `seq` and `hash`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainHead {
    pub last_seq: i64,
    pub last_hash: [u8; 32],
}

impl ChainHead {
    pub const fn genesis() -> Self {
        Self {
            last_seq: 0,
            last_hash: [0u8; 32],
        }
    }
}

impl Default for ChainHead {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Append-only valuation snapshot for a priced asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationSnapshot {
    pub snapshot_id: Uuid,
    pub ingestion_correlation_id: String,
    pub asset_type: String,
    pub asset_id: String,
    pub as_of: DateTime<Utc>,
    pub price: Decimal,
    pub currency: String,
    pub source: String,
    pub confidence: u8,
    pub payload_canonical: Vec<u8>,
    pub payload_hash: [u8; 32],
}

/// Append-only liquidity snapshot for an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub snapshot_id: Uuid,
    pub ingestion_correlation_id: String,
    pub asset_type: String,
    pub asset_id: String,
    pub as_of: DateTime<Utc>,
    pub haircut_bps: u16,
    pub time_to_cash_seconds: i64,
    pub source: String,
    pub payload_canonical: Vec<u8>,
    pub payload_hash: [u8; 32],
}
