//! Storage abstraction the rest of the core is generic over, plus two
//! implementations: an in-memory store for tests and local development, and
//! a PostgreSQL-backed store (behind the `postgres` feature) for production.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryLedgerStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStorage;

use crate::chain::NewEvent;
use crate::error::LedgerResult;
use crate::types::{Account, ChainHead, EventLogRow, LiquiditySnapshot, ValuationSnapshot};
use async_trait::async_trait;
use uuid::Uuid;

/// Everything the posting engine, risk snapshot layer, and verifier need
/// from a storage backend. Insert-only by construction: there is no
/// `update`/`delete` method on this trait.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn create_account(&self, account: Account) -> LedgerResult<Account>;
    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>>;
    async fn account_balance_cents(&self, account_id: Uuid) -> LedgerResult<i64>;

    /// Runs the full posting algorithm (§4.4 steps 3-11) under a single
    /// advisory-locked transaction: reserve the idempotency anchor, verify
    /// both accounts, insert the balanced entry pair, append the
    /// `TRANSFER_POSTED` event, and commit the anchor to `COMMITTED` — all
    /// without releasing the lock in between. A caller that loses the race
    /// for `idempotency_key` blocks on the lock until the winner commits,
    /// then takes the replay path and returns the winner's `tx_id`; it never
    /// observes a `RESERVED` anchor with no bound `tx_id`.
    #[allow(clippy::too_many_arguments)]
    async fn post_transfer(
        &self,
        idempotency_key: &str,
        request_hash: &str,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount_cents: i64,
        currency: &str,
        external_ref: &str,
        correlation_id: &str,
    ) -> LedgerResult<Uuid>;

    async fn record_valuation_snapshot(
        &self,
        snapshot: ValuationSnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid>;

    async fn record_liquidity_snapshot(
        &self,
        snapshot: LiquiditySnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid>;

    /// All event rows ordered by `seq`, for offline/online verification.
    async fn export_events(&self) -> LedgerResult<Vec<EventLogRow>>;

    /// The persisted chain-head singleton, checked against the last
    /// exported row by the verifier (§4.7 after-loop checks).
    async fn read_chain_head(&self) -> LedgerResult<ChainHead>;
}
