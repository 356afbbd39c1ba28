//! The posting engine: turns a transfer request into a balanced pair of
//! ledger entries, guarded by an idempotency anchor and followed by a single
//! `TRANSFER_POSTED` event. The atomic reserve-through-commit sequence lives
//! in the storage backend (see `storage::LedgerStorage::post_transfer`) so
//! the advisory lock it takes never has to be released and reacquired
//! between steps.

use crate::canonical::canonical_hash;
use crate::error::{LedgerError, LedgerResult};
use crate::guard::{validate_currency, validate_non_empty};
use crate::storage::LedgerStorage;
use uuid::Uuid;

/// Inputs to `post_transfer`. Mirrors the canonical request shape used to
/// compute `request_hash`, in field order.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub external_ref: String,
    pub idempotency_key: String,
    pub correlation_id: String,
}

impl TransferRequest {
    fn validate(&self) -> LedgerResult<()> {
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::validation(
                "from_account_id and to_account_id must differ",
            ));
        }
        if self.amount_cents <= 0 {
            return Err(LedgerError::validation("amount_cents must be positive"));
        }
        validate_currency(&self.currency)?;
        validate_non_empty("external_ref", &self.external_ref)?;
        validate_non_empty("idempotency_key", &self.idempotency_key)?;
        validate_non_empty("correlation_id", &self.correlation_id)?;
        Ok(())
    }

    /// The fixed-key canonical shape hashed to produce `request_hash`.
    fn canonical_shape(&self) -> serde_json::Value {
        serde_json::json!({
            "from_account_id": self.from_account_id.to_string(),
            "to_account_id": self.to_account_id.to_string(),
            "amount_cents": self.amount_cents,
            "currency": self.currency.to_uppercase(),
            "external_ref": self.external_ref,
            "idempotency_key": self.idempotency_key,
            "correlation_id": self.correlation_id,
        })
    }

    pub fn request_hash(&self) -> LedgerResult<String> {
        let (digest, _) = canonical_hash(&self.canonical_shape())
            .map_err(|e| LedgerError::validation(e.to_string()))?;
        Ok(hex::encode(digest))
    }
}

/// Post a balanced transfer, honoring idempotent replay. Everything past
/// `request_hash` computation — reserving the anchor, checking accounts,
/// and committing the entries/event/anchor — happens inside one atomic
/// storage call so a losing racer never sees a half-finished reservation.
pub async fn post_transfer(
    storage: &dyn LedgerStorage,
    request: TransferRequest,
) -> LedgerResult<Uuid> {
    request.validate()?;
    let request_hash = request.request_hash()?;

    storage
        .post_transfer(
            &request.idempotency_key,
            &request_hash,
            request.from_account_id,
            request.to_account_id,
            request.amount_cents,
            &request.currency,
            &request.external_ref,
            &request.correlation_id,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferRequest {
        TransferRequest {
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount_cents: 500,
            currency: "USD".to_string(),
            external_ref: "ext-1".to_string(),
            idempotency_key: "idem-1".to_string(),
            correlation_id: "corr-1".to_string(),
        }
    }

    #[test]
    fn rejects_same_account_transfer() {
        let mut req = sample();
        req.to_account_id = req.from_account_id;
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_amount() {
        let mut req = sample();
        req.amount_cents = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn request_hash_is_stable_for_equal_requests() {
        let req = sample();
        let h1 = req.request_hash().unwrap();
        let h2 = req.request_hash().unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn request_hash_changes_with_amount() {
        let req1 = sample();
        let mut req2 = sample();
        req2.amount_cents = 999;
        req2.idempotency_key = req1.idempotency_key.clone();
        req2.from_account_id = req1.from_account_id;
        req2.to_account_id = req1.to_account_id;
        assert_ne!(req1.request_hash().unwrap(), req2.request_hash().unwrap());
    }
}
