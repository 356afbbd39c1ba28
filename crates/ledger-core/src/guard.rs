//! Validation rules enforced at the storage boundary, independent of any
//! particular backend. Storage implementations call these before issuing
//! writes; they are the single source of truth for what makes a row valid.

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Account, EntryDirection, IdempotencyAnchor, IdempotencyStatus, LedgerEntry};

pub fn validate_currency(currency: &str) -> LedgerResult<()> {
    let is_valid = currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_uppercase());
    if !is_valid {
        return Err(LedgerError::validation(format!(
            "currency '{currency}' is not a 3-letter uppercase code"
        )));
    }
    Ok(())
}

pub fn validate_non_empty(field: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub fn validate_account(account: &Account) -> LedgerResult<()> {
    validate_non_empty("label", &account.label)?;
    validate_currency(&account.currency)
}

/// Enforce the balanced-pair invariant (I1/I2): exactly one DEBIT and one
/// CREDIT, equal amounts, equal currencies, distinct accounts.
pub fn validate_balanced_pair(entries: &[LedgerEntry]) -> LedgerResult<()> {
    if entries.len() != 2 {
        return Err(LedgerError::validation(format!(
            "a transaction must have exactly two entries, got {}",
            entries.len()
        )));
    }
    let debit = entries
        .iter()
        .find(|e| e.direction == EntryDirection::Debit)
        .ok_or_else(|| LedgerError::validation("transaction is missing a DEBIT entry"))?;
    let credit = entries
        .iter()
        .find(|e| e.direction == EntryDirection::Credit)
        .ok_or_else(|| LedgerError::validation("transaction is missing a CREDIT entry"))?;

    if debit.account_id == credit.account_id {
        return Err(LedgerError::validation(
            "debit and credit entries must reference distinct accounts",
        ));
    }
    if debit.amount_cents != credit.amount_cents {
        return Err(LedgerError::validation(
            "debit and credit amounts must be equal",
        ));
    }
    if debit.amount_cents <= 0 {
        return Err(LedgerError::validation("entry amounts must be positive"));
    }
    if debit.currency != credit.currency {
        return Err(LedgerError::validation(
            "debit and credit currencies must be equal",
        ));
    }
    validate_currency(&debit.currency)?;
    Ok(())
}

/// Guard the idempotency state machine: only `RESERVED -> COMMITTED` is a
/// legal transition, and a `COMMITTED` anchor is frozen.
pub fn validate_commit_transition(anchor: &IdempotencyAnchor) -> LedgerResult<()> {
    match anchor.status {
        IdempotencyStatus::Reserved => Ok(()),
        IdempotencyStatus::Committed => Err(LedgerError::validation(
            "cannot commit an idempotency anchor that is already COMMITTED",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(direction: EntryDirection, account: Uuid, amount: i64, currency: &str) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::new_v4(),
            tx_id: Uuid::new_v4(),
            account_id: account,
            direction,
            amount_cents: amount,
            currency: currency.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_a_balanced_pair() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let entries = vec![
            entry(EntryDirection::Debit, a, 1000, "USD"),
            entry(EntryDirection::Credit, b, 1000, "USD"),
        ];
        assert!(validate_balanced_pair(&entries).is_ok());
    }

    #[test]
    fn rejects_mismatched_amounts() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let entries = vec![
            entry(EntryDirection::Debit, a, 1000, "USD"),
            entry(EntryDirection::Credit, b, 999, "USD"),
        ];
        assert!(validate_balanced_pair(&entries).is_err());
    }

    #[test]
    fn rejects_same_account_on_both_sides() {
        let a = Uuid::new_v4();
        let entries = vec![
            entry(EntryDirection::Debit, a, 1000, "USD"),
            entry(EntryDirection::Credit, a, 1000, "USD"),
        ];
        assert!(validate_balanced_pair(&entries).is_err());
    }

    #[test]
    fn rejects_two_debits() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let entries = vec![
            entry(EntryDirection::Debit, a, 1000, "USD"),
            entry(EntryDirection::Debit, b, 1000, "USD"),
        ];
        assert!(validate_balanced_pair(&entries).is_err());
    }

    #[test]
    fn currency_must_be_three_uppercase_letters() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("US").is_err());
        assert!(validate_currency("USDD").is_err());
    }
}
