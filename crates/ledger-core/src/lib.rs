//! Tamper-evident, append-only, double-entry accounting ledger core.
//!
//! Enforces double-entry invariants, request idempotency, and a
//! cryptographically hash-chained event log that can be verified online
//! (against a live storage backend) or offline (against an exported
//! manifest, see [`verify`]).

#![deny(unsafe_code)]

pub mod canonical;
pub mod chain;
pub mod error;
pub mod guard;
pub mod posting;
pub mod risk;
pub mod storage;
pub mod types;
pub mod verify;

pub use error::{LedgerError, LedgerResult};
pub use posting::{post_transfer, TransferRequest};
pub use risk::{record_liquidity_snapshot, record_valuation_snapshot, LiquidityInput, ValuationInput};
pub use storage::LedgerStorage;
pub use types::{
    Account, ChainHead, EntryDirection, EventLogRow, IdempotencyAnchor, IdempotencyStatus,
    LedgerEntry, LedgerTx, LiquiditySnapshot, ValuationSnapshot,
};
pub use verify::{verify_chain, verify_minimal, verify_strong, MinimalRow, VerifyReport};
