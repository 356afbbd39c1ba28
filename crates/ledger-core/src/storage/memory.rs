use super::LedgerStorage;
use crate::chain::{build_row, NewEvent};
use crate::canonical::canonical_hash;
use crate::error::{LedgerError, LedgerResult};
use crate::guard::{validate_account, validate_balanced_pair, validate_commit_transition};
use crate::types::{
    Account, ChainHead, EntryDirection, EventLogRow, IdempotencyAnchor, IdempotencyStatus,
    LedgerEntry, LedgerTx, LiquiditySnapshot, ValuationSnapshot,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process store guarded by a single mutex, mirroring the single global
/// critical section the chain engine requires in production: every write
/// here is effectively serialized, which is both correct and the simplest
/// possible implementation of that constraint.
#[derive(Default)]
pub struct MemoryLedgerStorage {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    txs: HashMap<Uuid, LedgerTx>,
    entries: Vec<LedgerEntry>,
    idempotency: HashMap<String, IdempotencyAnchor>,
    events: Vec<EventLogRow>,
    head: ChainHead,
    valuations: HashMap<Uuid, ValuationSnapshot>,
    liquidity: HashMap<Uuid, LiquiditySnapshot>,
}

impl MemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn append_event(&mut self, event: NewEvent) -> LedgerResult<EventLogRow> {
        let row = build_row(self.head, event, Utc::now())?;
        self.head = ChainHead {
            last_seq: row.seq,
            last_hash: row.hash,
        };
        self.events.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedgerStorage {
    async fn create_account(&self, account: Account) -> LedgerResult<Account> {
        validate_account(&account)?;
        let mut state = self.state.lock().await;
        state.accounts.insert(account.account_id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&account_id).cloned())
    }

    async fn account_balance_cents(&self, account_id: Uuid) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Err(LedgerError::not_found("account does not exist"));
        }
        let balance = state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .fold(0i64, |acc, e| match e.direction {
                crate::types::EntryDirection::Credit => acc + e.amount_cents,
                crate::types::EntryDirection::Debit => acc - e.amount_cents,
            });
        Ok(balance)
    }

    /// Holds `self.state`'s single mutex for the whole operation: no other
    /// caller can even begin a `post_transfer` while this one is mid-flight,
    /// so there is no window where a racer can observe a RESERVED anchor
    /// with no bound `tx_id`. All reads happen before any write, and the
    /// writes (anchor, tx, entries, event) land together at the end, which
    /// is this backend's equivalent of a single all-or-nothing transaction.
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
        let mut state = self.state.lock().await;

        if let Some(existing) = state.idempotency.get(idempotency_key) {
            if existing.request_hash != request_hash {
                return Err(LedgerError::IdempotencyConflict {
                    key: idempotency_key.to_string(),
                });
            }
            return match existing.status {
                IdempotencyStatus::Committed => existing
                    .tx_id
                    .ok_or_else(|| LedgerError::storage("COMMITTED anchor missing tx_id")),
                IdempotencyStatus::Reserved => Err(LedgerError::storage(
                    "idempotency anchor reserved without a concurrent committer",
                )),
            };
        }

        let from = state
            .accounts
            .get(&from_account_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("from_account_id does not exist"))?;
        let to = state
            .accounts
            .get(&to_account_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("to_account_id does not exist"))?;
        if from.currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: from.currency,
            });
        }
        if to.currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: to.currency,
            });
        }
        if state.txs.values().any(|t| t.external_ref == external_ref) {
            return Err(LedgerError::validation("external_ref already used"));
        }

        let tx_id = Uuid::new_v4();
        let now = Utc::now();
        let debit = LedgerEntry {
            entry_id: Uuid::new_v4(),
            tx_id,
            account_id: from.account_id,
            direction: EntryDirection::Debit,
            amount_cents,
            currency: currency.to_string(),
            created_at: now,
        };
        let credit = LedgerEntry {
            entry_id: Uuid::new_v4(),
            tx_id,
            account_id: to.account_id,
            direction: EntryDirection::Credit,
            amount_cents,
            currency: currency.to_string(),
            created_at: now,
        };
        validate_balanced_pair(&[debit.clone(), credit.clone()])?;

        let event_payload = serde_json::json!({
            "tx_id": tx_id.to_string(),
            "from_account_id": from.account_id.to_string(),
            "to_account_id": to.account_id.to_string(),
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
        let response_canonical = canonical_hash(&serde_json::json!({ "tx_id": tx_id.to_string() }))
            .map_err(|e| LedgerError::validation(e.to_string()))?
            .1;

        let reserved = IdempotencyAnchor {
            idempotency_key: idempotency_key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Reserved,
            tx_id: None,
            response_canonical: None,
            created_at: now,
        };
        validate_commit_transition(&reserved)?;

        state.txs.insert(
            tx_id,
            LedgerTx {
                tx_id,
                external_ref: external_ref.to_string(),
                correlation_id: correlation_id.to_string(),
                idempotency_key: idempotency_key.to_string(),
                created_at: now,
            },
        );
        state.entries.push(debit);
        state.entries.push(credit);
        state.append_event(event)?;
        state.idempotency.insert(
            idempotency_key.to_string(),
            IdempotencyAnchor {
                status: IdempotencyStatus::Committed,
                tx_id: Some(tx_id),
                response_canonical: Some(response_canonical),
                ..reserved
            },
        );

        Ok(tx_id)
    }

    async fn record_valuation_snapshot(
        &self,
        snapshot: ValuationSnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid> {
        let mut state = self.state.lock().await;
        let duplicate = state.valuations.values().any(|existing| {
            existing.asset_type == snapshot.asset_type
                && existing.asset_id == snapshot.asset_id
                && existing.as_of == snapshot.as_of
                && existing.source == snapshot.source
                && existing.payload_hash == snapshot.payload_hash
        });
        if duplicate {
            return Err(LedgerError::validation(
                "duplicate valuation snapshot for (asset_type, asset_id, as_of, source, payload_hash)",
            ));
        }
        let id = snapshot.snapshot_id;
        state.valuations.insert(id, snapshot);
        state.append_event(event)?;
        Ok(id)
    }

    async fn record_liquidity_snapshot(
        &self,
        snapshot: LiquiditySnapshot,
        event: NewEvent,
    ) -> LedgerResult<Uuid> {
        let mut state = self.state.lock().await;
        let duplicate = state.liquidity.values().any(|existing| {
            existing.asset_type == snapshot.asset_type
                && existing.asset_id == snapshot.asset_id
                && existing.as_of == snapshot.as_of
                && existing.source == snapshot.source
                && existing.payload_hash == snapshot.payload_hash
        });
        if duplicate {
            return Err(LedgerError::validation(
                "duplicate liquidity snapshot for (asset_type, asset_id, as_of, source, payload_hash)",
            ));
        }
        let id = snapshot.snapshot_id;
        state.liquidity.insert(id, snapshot);
        state.append_event(event)?;
        Ok(id)
    }

    async fn export_events(&self) -> LedgerResult<Vec<EventLogRow>> {
        let state = self.state.lock().await;
        Ok(state.events.clone())
    }

    async fn read_chain_head(&self) -> LedgerResult<ChainHead> {
        let state = self.state.lock().await;
        Ok(state.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonical_hash;
    use crate::posting::{post_transfer, TransferRequest};
    use serde_json::json;

    #[tokio::test]
    async fn creates_account_and_reads_it_back() {
        let storage = MemoryLedgerStorage::new();
        let account = Account::new("alice", "USD");
        storage.create_account(account.clone()).await.unwrap();
        let fetched = storage.get_account(account.account_id).await.unwrap();
        assert_eq!(fetched.unwrap().label, "alice");
    }

    #[tokio::test]
    async fn post_transfer_moves_balance_and_appends_one_event() {
        let storage = MemoryLedgerStorage::new();
        let a = storage
            .create_account(Account::new("alice", "USD"))
            .await
            .unwrap();
        let b = storage
            .create_account(Account::new("bob", "USD"))
            .await
            .unwrap();

        let request = TransferRequest {
            from_account_id: a.account_id,
            to_account_id: b.account_id,
            amount_cents: 1000,
            currency: "USD".to_string(),
            external_ref: "ext-1".to_string(),
            idempotency_key: "idem-1".to_string(),
            correlation_id: "corr-1".to_string(),
        };

        let tx_id = post_transfer(&storage, request).await.unwrap();
        assert_eq!(storage.account_balance_cents(a.account_id).await.unwrap(), -1000);
        assert_eq!(storage.account_balance_cents(b.account_id).await.unwrap(), 1000);

        let events = storage.export_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "TRANSFER_POSTED");
        assert_eq!(events[0].aggregate_id, tx_id.to_string());

        let head = storage.read_chain_head().await.unwrap();
        assert_eq!(head.last_seq, 1);
        assert_eq!(head.last_hash, events[0].hash);
    }

    #[tokio::test]
    async fn replaying_same_request_returns_same_tx_id() {
        let storage = MemoryLedgerStorage::new();
        let a = storage
            .create_account(Account::new("alice", "USD"))
            .await
            .unwrap();
        let b = storage
            .create_account(Account::new("bob", "USD"))
            .await
            .unwrap();

        let request = TransferRequest {
            from_account_id: a.account_id,
            to_account_id: b.account_id,
            amount_cents: 250,
            currency: "USD".to_string(),
            external_ref: "ext-2".to_string(),
            idempotency_key: "idem-2".to_string(),
            correlation_id: "corr-2".to_string(),
        };

        let first = post_transfer(&storage, request.clone()).await.unwrap();
        let second = post_transfer(&storage, request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.export_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_replay_is_rejected() {
        let storage = MemoryLedgerStorage::new();
        let a = storage
            .create_account(Account::new("alice", "USD"))
            .await
            .unwrap();
        let b = storage
            .create_account(Account::new("bob", "USD"))
            .await
            .unwrap();

        let mut request = TransferRequest {
            from_account_id: a.account_id,
            to_account_id: b.account_id,
            amount_cents: 250,
            currency: "USD".to_string(),
            external_ref: "ext-3".to_string(),
            idempotency_key: "idem-3".to_string(),
            correlation_id: "corr-3".to_string(),
        };
        post_transfer(&storage, request.clone()).await.unwrap();

        request.amount_cents = 999;
        request.external_ref = "ext-3b".to_string();
        let result = post_transfer(&storage, request).await;
        assert!(matches!(result, Err(LedgerError::IdempotencyConflict { .. })));
    }

    #[tokio::test]
    async fn valuation_snapshot_appends_matching_event() {
        let storage = MemoryLedgerStorage::new();
        let payload = json!({"asset_id": "AAPL"});
        let (payload_hash, payload_canonical) = canonical_hash(&payload).unwrap();
        let snapshot = ValuationSnapshot {
            snapshot_id: Uuid::new_v4(),
            ingestion_correlation_id: "corr-4".to_string(),
            asset_type: "EQUITY".to_string(),
            asset_id: "AAPL".to_string(),
            as_of: Utc::now(),
            price: rust_decimal::Decimal::new(19050, 2),
            currency: "USD".to_string(),
            source: "feed-a".to_string(),
            confidence: 90,
            payload_canonical: payload_canonical.clone(),
            payload_hash,
        };
        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "VALUATION_SNAPSHOT".to_string(),
            aggregate_type: "RISK_SNAPSHOT".to_string(),
            aggregate_id: snapshot.snapshot_id.to_string(),
            correlation_id: snapshot.ingestion_correlation_id.clone(),
            payload_json: payload,
            payload_canonical,
        };
        storage
            .record_valuation_snapshot(snapshot, event)
            .await
            .unwrap();
        assert_eq!(storage.export_events().await.unwrap().len(), 1);
    }
}
