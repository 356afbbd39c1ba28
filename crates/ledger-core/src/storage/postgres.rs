use super::LedgerStorage;
use crate::canonical::canonical_hash;
use crate::chain::{build_row, NewEvent};
use crate::error::{LedgerError, LedgerResult};
use crate::guard::{validate_account, validate_balanced_pair, validate_commit_transition};
use crate::types::{
    Account, ChainHead, EntryDirection, EventLogRow, IdempotencyAnchor, IdempotencyStatus,
    LedgerEntry, LiquiditySnapshot, ValuationSnapshot,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// PostgreSQL-backed store. Schema bootstrap, the chain-head exclusive lock,
/// and the per-key advisory lock all happen inside a single transaction per
/// write operation, matching the critical section described for the chain
/// engine and the idempotency engine.
pub struct PostgresLedgerStorage {
    pool: PgPool,
}

impl PostgresLedgerStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::storage(format!("postgres connect failed: {e}")))?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> LedgerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                account_id UUID PRIMARY KEY,
                label TEXT NOT NULL,
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_tx (
                tx_id UUID PRIMARY KEY,
                external_ref TEXT NOT NULL UNIQUE,
                correlation_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entry (
                entry_id UUID PRIMARY KEY,
                tx_id UUID NOT NULL REFERENCES ledger_tx (tx_id),
                account_id UUID NOT NULL REFERENCES ledger_accounts (account_id),
                direction TEXT NOT NULL,
                amount_cents BIGINT NOT NULL,
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_idempotency (
                idempotency_key TEXT PRIMARY KEY,
                request_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                tx_id UUID NULL,
                response_canonical BYTEA NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_event_log (
                seq BIGINT PRIMARY KEY,
                event_id UUID NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                payload_json JSONB NOT NULL,
                payload_canonical BYTEA NOT NULL,
                payload_hash BYTEA NOT NULL,
                prev_hash BYTEA NOT NULL,
                hash BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_chain_head (
                id BOOLEAN PRIMARY KEY DEFAULT TRUE,
                last_seq BIGINT NOT NULL,
                last_hash BYTEA NOT NULL,
                CHECK (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO ledger_chain_head (id, last_seq, last_hash) VALUES (TRUE, 0, '\\x')
             ON CONFLICT (id) DO NOTHING",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_valuation_snapshot (
                snapshot_id UUID PRIMARY KEY,
                asset_type TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                as_of TIMESTAMPTZ NOT NULL,
                price NUMERIC NOT NULL,
                currency TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence SMALLINT NOT NULL,
                payload_hash BYTEA NOT NULL,
                UNIQUE (asset_type, asset_id, as_of, source, payload_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_liquidity_snapshot (
                snapshot_id UUID PRIMARY KEY,
                asset_type TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                as_of TIMESTAMPTZ NOT NULL,
                haircut_bps INTEGER NOT NULL,
                time_to_cash_seconds BIGINT NOT NULL,
                source TEXT NOT NULL,
                payload_hash BYTEA NOT NULL,
                UNIQUE (asset_type, asset_id, as_of, source, payload_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hash an idempotency key down to a signed 64-bit integer suitable for
    /// `pg_advisory_xact_lock`.
    fn advisory_lock_key(key: &str) -> i64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as i64
    }

    async fn read_head(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> LedgerResult<ChainHead> {
        sqlx::query("LOCK TABLE ledger_chain_head IN EXCLUSIVE MODE")
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT last_seq, last_hash FROM ledger_chain_head WHERE id = TRUE")
            .fetch_one(&mut **tx)
            .await?;
        let last_seq: i64 = row.try_get("last_seq")?;
        let last_hash_bytes: Vec<u8> = row.try_get("last_hash")?;
        let mut last_hash = [0u8; 32];
        if last_hash_bytes.len() == 32 {
            last_hash.copy_from_slice(&last_hash_bytes);
        }
        Ok(ChainHead { last_seq, last_hash })
    }

    async fn append_event_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: NewEvent,
    ) -> LedgerResult<EventLogRow> {
        let head = Self::read_head(tx).await?;
        let row = build_row(head, event, Utc::now())?;

        sqlx::query(
            r#"
            INSERT INTO ledger_event_log (
                seq, event_id, event_type, aggregate_type, aggregate_id, correlation_id,
                payload_json, payload_canonical, payload_hash, prev_hash, hash, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            "#,
        )
        .bind(row.seq)
        .bind(row.event_id)
        .bind(&row.event_type)
        .bind(&row.aggregate_type)
        .bind(&row.aggregate_id)
        .bind(&row.correlation_id)
        .bind(&row.payload_json)
        .bind(&row.payload_canonical)
        .bind(&row.payload_hash[..])
        .bind(&row.prev_hash[..])
        .bind(&row.hash[..])
        .bind(row.created_at)
        .execute(&mut **tx)
        .await?;

        sqlx::query("UPDATE ledger_chain_head SET last_seq = $1, last_hash = $2 WHERE id = TRUE")
            .bind(row.seq)
            .bind(&row.hash[..])
            .execute(&mut **tx)
            .await?;

        Ok(row)
    }
}

#[async_trait]
impl LedgerStorage for PostgresLedgerStorage {
    async fn create_account(&self, account: Account) -> LedgerResult<Account> {
        validate_account(&account)?;
        sqlx::query(
            "INSERT INTO ledger_accounts (account_id, label, currency, created_at) VALUES ($1,$2,$3,$4)",
        )
        .bind(account.account_id)
        .bind(&account.label)
        .bind(&account.currency)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>> {
        let row = sqlx::query(
            "SELECT account_id, label, currency, created_at FROM ledger_accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(Account {
                account_id: row.try_get("account_id")?,
                label: row.try_get("label")?,
                currency: row.try_get("currency")?,
                created_at: row.try_get("created_at")?,
            }),
            None => None,
        })
    }

    async fn account_balance_cents(&self, account_id: Uuid) -> LedgerResult<i64> {
        if self.get_account(account_id).await?.is_none() {
            return Err(LedgerError::not_found("account does not exist"));
        }
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN direction = 'CREDIT' THEN amount_cents ELSE -amount_cents END), 0) AS balance
            FROM ledger_entry WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("balance")?)
    }

    /// Runs the whole posting algorithm inside one transaction that holds
    /// `pg_advisory_xact_lock(hash(idempotency_key))` from the first
    /// statement to the final `COMMIT`. A racer blocking on the lock is,
    /// by the time it acquires it, guaranteed to see either no anchor row
    /// (if the winner rolled back) or a `COMMITTED` one with a bound
    /// `tx_id` (if the winner succeeded) — never a `RESERVED` row with no
    /// `tx_id`, since that state only ever exists while this same
    /// transaction still holds the lock.
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
    ) -> LedgerResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(Self::advisory_lock_key(idempotency_key))
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            "SELECT request_hash, status, tx_id FROM ledger_idempotency WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let existing_hash: String = row.try_get("request_hash")?;
            if existing_hash != request_hash {
                return Err(LedgerError::IdempotencyConflict {
                    key: idempotency_key.to_string(),
                });
            }
            let status: String = row.try_get("status")?;
            return match status.as_str() {
                "COMMITTED" => {
                    let existing_tx_id: Option<Uuid> = row.try_get("tx_id")?;
                    let existing_tx_id = existing_tx_id
                        .ok_or_else(|| LedgerError::storage("COMMITTED anchor missing tx_id"))?;
                    tx.commit().await?;
                    Ok(existing_tx_id)
                }
                _ => Err(LedgerError::storage(
                    "idempotency anchor reserved without a concurrent committer",
                )),
            };
        }

        let from_row = sqlx::query(
            "SELECT account_id, label, currency, created_at FROM ledger_accounts WHERE account_id = $1",
        )
        .bind(from_account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("from_account_id does not exist"))?;
        let to_row = sqlx::query(
            "SELECT account_id, label, currency, created_at FROM ledger_accounts WHERE account_id = $1",
        )
        .bind(to_account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("to_account_id does not exist"))?;
        let from_currency: String = from_row.try_get("currency")?;
        let to_currency: String = to_row.try_get("currency")?;
        if from_currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: from_currency,
            });
        }
        if to_currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: to_currency,
            });
        }

        let tx_id = Uuid::new_v4();
        let now = Utc::now();
        let debit = LedgerEntry {
            entry_id: Uuid::new_v4(),
            tx_id,
            account_id: from_account_id,
            direction: EntryDirection::Debit,
            amount_cents,
            currency: currency.to_string(),
            created_at: now,
        };
        let credit = LedgerEntry {
            entry_id: Uuid::new_v4(),
            tx_id,
            account_id: to_account_id,
            direction: EntryDirection::Credit,
            amount_cents,
            currency: currency.to_string(),
            created_at: now,
        };
        validate_balanced_pair(&[debit.clone(), credit.clone()])?;

        let reserved = IdempotencyAnchor {
            idempotency_key: idempotency_key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Reserved,
            tx_id: None,
            response_canonical: None,
            created_at: now,
        };
        validate_commit_transition(&reserved)?;

        sqlx::query(
            "INSERT INTO ledger_idempotency (idempotency_key, request_hash, status, created_at) VALUES ($1,$2,'RESERVED',$3)",
        )
        .bind(idempotency_key)
        .bind(request_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ledger_tx (tx_id, external_ref, correlation_id, idempotency_key, created_at) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(tx_id)
        .bind(external_ref)
        .bind(correlation_id)
        .bind(idempotency_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for entry in [&debit, &credit] {
            sqlx::query(
                "INSERT INTO ledger_entry (entry_id, tx_id, account_id, direction, amount_cents, currency, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(entry.entry_id)
            .bind(entry.tx_id)
            .bind(entry.account_id)
            .bind(direction_str(entry.direction))
            .bind(entry.amount_cents)
            .bind(&entry.currency)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let event_payload = serde_json::json!({
            "tx_id": tx_id.to_string(),
            "from_account_id": from_account_id.to_string(),
            "to_account_id": to_account_id.to_string(),
            "amount_cents": amount_cents,
            "currency": currency,
            "external_ref": external_ref,
            "idempotency_key": idempotency_key,
        });
        let (_, payload_canonical) = canonical_hash(&event_payload)
            .map_err(|e| LedgerError::validation(e.to_string()))?;
        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "TRANSFER_POSTED".to_string(),
            aggregate_type: "LEDGER_TX".to_string(),
            aggregate_id: tx_id.to_string(),
            correlation_id: correlation_id.to_string(),
            payload_json: event_payload,
            payload_canonical,
        };
        Self::append_event_in_tx(&mut tx, event).await?;

        let response_canonical = canonical_hash(&serde_json::json!({ "tx_id": tx_id.to_string() }))
            .map_err(|e| LedgerError::validation(e.to_string()))?
            .1;
        sqlx::query(
            "UPDATE ledger_idempotency SET status = 'COMMITTED', tx_id = $1, response_canonical = $2 WHERE idempotency_key = $3 AND status = 'RESERVED'",
        )
        .bind(tx_id)
        .bind(&response_canonical)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tx_id)
    }

    async fn record_valuation_snapshot(
        &self,
        snapshot: ValuationSnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid> {
        let mut db_tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ledger_valuation_snapshot (
                snapshot_id, asset_type, asset_id, as_of, price, currency, source, confidence, payload_hash
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(&snapshot.asset_type)
        .bind(&snapshot.asset_id)
        .bind(snapshot.as_of)
        .bind(snapshot.price)
        .bind(&snapshot.currency)
        .bind(&snapshot.source)
        .bind(snapshot.confidence as i16)
        .bind(&snapshot.payload_hash[..])
        .execute(&mut *db_tx)
        .await
        .map_err(|e| LedgerError::validation(format!("duplicate or invalid valuation snapshot: {e}")))?;

        Self::append_event_in_tx(&mut db_tx, event).await?;
        db_tx.commit().await?;
        Ok(snapshot.snapshot_id)
    }

    async fn record_liquidity_snapshot(
        &self,
        snapshot: LiquiditySnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid> {
        let mut db_tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ledger_liquidity_snapshot (
                snapshot_id, asset_type, asset_id, as_of, haircut_bps, time_to_cash_seconds, source, payload_hash
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(&snapshot.asset_type)
        .bind(&snapshot.asset_id)
        .bind(snapshot.as_of)
        .bind(snapshot.haircut_bps as i32)
        .bind(snapshot.time_to_cash_seconds)
        .bind(&snapshot.source)
        .bind(&snapshot.payload_hash[..])
        .execute(&mut *db_tx)
        .await
        .map_err(|e| LedgerError::validation(format!("duplicate or invalid liquidity snapshot: {e}")))?;

        Self::append_event_in_tx(&mut db_tx, event).await?;
        db_tx.commit().await?;
        Ok(snapshot.snapshot_id)
    }

    async fn export_events(&self) -> LedgerResult<Vec<EventLogRow>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, event_id, event_type, aggregate_type, aggregate_id, correlation_id,
                   payload_json, payload_canonical, payload_hash, prev_hash, hash, created_at
            FROM ledger_event_log ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload_hash_bytes: Vec<u8> = row.try_get("payload_hash")?;
            let prev_hash_bytes: Vec<u8> = row.try_get("prev_hash")?;
            let hash_bytes: Vec<u8> = row.try_get("hash")?;
            out.push(EventLogRow {
                seq: row.try_get("seq")?,
                event_id: row.try_get("event_id")?,
                event_type: row.try_get("event_type")?,
                aggregate_type: row.try_get("aggregate_type")?,
                aggregate_id: row.try_get("aggregate_id")?,
                correlation_id: row.try_get("correlation_id")?,
                payload_json: row.try_get("payload_json")?,
                payload_canonical: row.try_get("payload_canonical")?,
                payload_hash: to_array(&payload_hash_bytes)?,
                prev_hash: to_array(&prev_hash_bytes)?,
                hash: to_array(&hash_bytes)?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn read_chain_head(&self) -> LedgerResult<ChainHead> {
        let row = sqlx::query("SELECT last_seq, last_hash FROM ledger_chain_head WHERE id = TRUE")
            .fetch_one(&self.pool)
            .await?;
        let last_seq: i64 = row.try_get("last_seq")?;
        let last_hash_bytes: Vec<u8> = row.try_get("last_hash")?;
        let mut last_hash = [0u8; 32];
        if last_hash_bytes.len() == 32 {
            last_hash.copy_from_slice(&last_hash_bytes);
        }
        Ok(ChainHead { last_seq, last_hash })
    }
}

fn direction_str(direction: EntryDirection) -> &'static str {
    match direction {
        EntryDirection::Debit => "DEBIT",
        EntryDirection::Credit => "CREDIT",
    }
}

fn to_array(bytes: &[u8]) -> LedgerResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| LedgerError::storage("expected a 32-byte hash column"))
}
