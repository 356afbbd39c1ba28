//! Risk snapshot layer: append-only valuation and liquidity snapshots, each
//! paired 1:1 with an event log row.

use crate::chain::NewEvent;
use crate::error::{LedgerError, LedgerResult};
use crate::guard::{validate_currency, validate_non_empty};
use crate::storage::LedgerStorage;
use crate::types::{LiquiditySnapshot, ValuationSnapshot};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

/// Caller-supplied inputs for a valuation snapshot. The payload hash
/// convention documented alongside this module is reproduced so external
/// callers can independently recompute it.
pub struct ValuationInput {
    pub ingestion_correlation_id: String,
    pub asset_type: String,
    pub asset_id: String,
    pub as_of: DateTime<Utc>,
    pub price: Decimal,
    pub currency: String,
    pub source: String,
    pub confidence: u8,
}

pub struct LiquidityInput {
    pub ingestion_correlation_id: String,
    pub asset_type: String,
    pub asset_id: String,
    pub as_of: DateTime<Utc>,
    pub haircut_bps: u16,
    pub time_to_cash_seconds: i64,
    pub source: String,
}

fn validate_common(
    asset_type: &str,
    asset_id: &str,
    source: &str,
    correlation_id: &str,
) -> LedgerResult<()> {
    validate_non_empty("asset_type", asset_type)?;
    validate_non_empty("asset_id", asset_id)?;
    validate_non_empty("source", source)?;
    validate_non_empty("ingestion_correlation_id", correlation_id)?;
    Ok(())
}

pub async fn record_valuation_snapshot(
    storage: &dyn LedgerStorage,
    input: ValuationInput,
) -> LedgerResult<Uuid> {
    validate_common(
        &input.asset_type,
        &input.asset_id,
        &input.source,
        &input.ingestion_correlation_id,
    )?;
    validate_currency(&input.currency)?;
    if input.price < Decimal::ZERO {
        return Err(LedgerError::validation("price must be >= 0"));
    }
    if input.confidence > 100 {
        return Err(LedgerError::validation("confidence must be in [0,100]"));
    }

    let snapshot_id = Uuid::new_v4();
    let payload = json!({
        "snapshot_id": snapshot_id.to_string(),
        "asset_type": input.asset_type,
        "asset_id": input.asset_id,
        "as_of": input.as_of.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        "price": input.price.to_string(),
        "currency": input.currency.to_uppercase(),
        "source": input.source,
        "confidence": input.confidence,
    });
    let (_, payload_canonical) =
        crate::canonical::canonical_hash(&payload).map_err(|e| LedgerError::validation(e.to_string()))?;

    let material = format!(
        "valuation_snapshot:v1|{}|{}|{}|{}|{}|{}|{}|{}",
        input.asset_type,
        input.asset_id,
        input.as_of.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        input.price,
        input.currency.to_uppercase(),
        input.source,
        input.confidence,
        String::from_utf8_lossy(&payload_canonical),
    );
    let payload_hash = crate::canonical::hash(material.as_bytes());

    let snapshot = ValuationSnapshot {
        snapshot_id,
        ingestion_correlation_id: input.ingestion_correlation_id.clone(),
        asset_type: input.asset_type.clone(),
        asset_id: input.asset_id.clone(),
        as_of: input.as_of,
        price: input.price,
        currency: input.currency.to_uppercase(),
        source: input.source.clone(),
        confidence: input.confidence,
        payload_canonical: payload_canonical.clone(),
        payload_hash,
    };

    let event = NewEvent {
        event_id: Uuid::new_v4(),
        event_type: "VALUATION_SNAPSHOT".to_string(),
        aggregate_type: "RISK_SNAPSHOT".to_string(),
        aggregate_id: snapshot_id.to_string(),
        correlation_id: input.ingestion_correlation_id,
        payload_json: payload,
        payload_canonical,
    };

    storage.record_valuation_snapshot(snapshot, event).await
}

pub async fn record_liquidity_snapshot(
    storage: &dyn LedgerStorage,
    input: LiquidityInput,
) -> LedgerResult<Uuid> {
    validate_common(
        &input.asset_type,
        &input.asset_id,
        &input.source,
        &input.ingestion_correlation_id,
    )?;
    if input.haircut_bps > 10_000 {
        return Err(LedgerError::validation("haircut_bps must be in [0,10000]"));
    }
    if input.time_to_cash_seconds < 0 {
        return Err(LedgerError::validation(
            "time_to_cash_seconds must be >= 0",
        ));
    }

    let snapshot_id = Uuid::new_v4();
    let payload = json!({
        "snapshot_id": snapshot_id.to_string(),
        "asset_type": input.asset_type,
        "asset_id": input.asset_id,
        "as_of": input.as_of.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        "haircut_bps": input.haircut_bps,
        "time_to_cash_seconds": input.time_to_cash_seconds,
        "source": input.source,
    });
    let (_, payload_canonical) =
        crate::canonical::canonical_hash(&payload).map_err(|e| LedgerError::validation(e.to_string()))?;

    let material = format!(
        "liquidity_snapshot:v1|{}|{}|{}|{}|{}|{}|{}",
        input.asset_type,
        input.asset_id,
        input.as_of.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        input.haircut_bps,
        input.time_to_cash_seconds,
        input.source,
        String::from_utf8_lossy(&payload_canonical),
    );
    let payload_hash = crate::canonical::hash(material.as_bytes());

    let snapshot = LiquiditySnapshot {
        snapshot_id,
        ingestion_correlation_id: input.ingestion_correlation_id.clone(),
        asset_type: input.asset_type.clone(),
        asset_id: input.asset_id.clone(),
        as_of: input.as_of,
        haircut_bps: input.haircut_bps,
        time_to_cash_seconds: input.time_to_cash_seconds,
        source: input.source.clone(),
        payload_canonical: payload_canonical.clone(),
        payload_hash,
    };

    let event = NewEvent {
        event_id: Uuid::new_v4(),
        event_type: "LIQUIDITY_SNAPSHOT".to_string(),
        aggregate_type: "RISK_SNAPSHOT".to_string(),
        aggregate_id: snapshot_id.to_string(),
        correlation_id: input.ingestion_correlation_id,
        payload_json: payload,
        payload_canonical,
    };

    storage.record_liquidity_snapshot(snapshot, event).await
}
