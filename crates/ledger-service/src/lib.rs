#![deny(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ledger_core::{
    post_transfer, record_liquidity_snapshot, record_valuation_snapshot, storage::MemoryLedgerStorage,
    verify_chain, Account, LedgerError, LedgerStorage, LiquidityInput, TransferRequest,
    ValuationInput, VerifyReport,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Caps in-flight requests at the edge; the core itself never queues.
const MAX_IN_FLIGHT_REQUESTS: usize = 512;

const ACCOUNT_CREATE_DEADLINE: Duration = Duration::from_secs(3);
const TRANSFER_POST_DEADLINE: Duration = Duration::from_secs(5);
const BALANCE_READ_DEADLINE: Duration = Duration::from_secs(3);

/// Bounds a core call to `deadline`, surfacing a timeout as the same
/// `DeadlineExceeded` kind the core itself uses for cancellation.
async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, LedgerError>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ApiError::Core(LedgerError::DeadlineExceeded)),
    }
}

/// Ledger storage backend selection, mirroring the memory/postgres split the
/// core exposes.
#[derive(Debug, Clone, Default)]
pub enum LedgerBackendConfig {
    #[default]
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub backend: LedgerBackendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackendConfig::Memory,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub storage: Arc<dyn LedgerStorage>,
    pub backend_label: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let (storage, backend_label): (Arc<dyn LedgerStorage>, &'static str) = match config.backend {
            LedgerBackendConfig::Memory => (Arc::new(MemoryLedgerStorage::new()), "memory"),
            LedgerBackendConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = ledger_core::storage::PostgresLedgerStorage::connect(
                    &database_url,
                    max_connections,
                )
                .await
                .map_err(ServiceError::Core)?;
                (Arc::new(store), "postgres")
            }
        };

        Ok(Self {
            storage,
            backend_label,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(create_account))
        .route("/v1/accounts/:account_id/balance", get(balance))
        .route("/v1/transfers", post(post_transfer_handler))
        .route("/v1/verify", get(verify))
        .route("/v1/risk/valuation", post(record_valuation))
        .route("/v1/risk/liquidity", post(record_liquidity))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] LedgerError),
}

/// HTTP-facing error wrapper. Maps the core's error taxonomy onto the status
/// codes the external interface contract specifies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] LedgerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Core(err) = self;
        let status = match &err {
            LedgerError::Validation(_) | LedgerError::CurrencyMismatch { .. } => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            LedgerError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            LedgerError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            LedgerError::Storage(_) | LedgerError::IntegrityBreak { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &err {
            LedgerError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "ledger-service",
        ledger_backend: state.backend_label,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CreateAccountRequest {
    label: String,
    currency: String,
}

#[derive(Debug, Clone, Serialize)]
struct CreateAccountResponse {
    account_id: Uuid,
}

async fn create_account(
    State(state): State<ServiceState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<Json<CreateAccountResponse>, ApiError> {
    let account = Account::new(request.label, request.currency.to_uppercase());
    let created = with_deadline(ACCOUNT_CREATE_DEADLINE, state.storage.create_account(account)).await?;
    Ok(Json(CreateAccountResponse {
        account_id: created.account_id,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    account_id: Uuid,
    balance_cents: i64,
}

async fn balance(
    Path(account_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance_cents = with_deadline(
        BALANCE_READ_DEADLINE,
        state.storage.account_balance_cents(account_id),
    )
    .await?;
    Ok(Json(BalanceResponse {
        account_id,
        balance_cents,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct PostTransferHttpRequest {
    from_account_id: Uuid,
    to_account_id: Uuid,
    amount_cents: i64,
    currency: String,
    external_ref: String,
    idempotency_key: String,
    correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct PostTransferResponse {
    tx_id: Uuid,
}

async fn post_transfer_handler(
    State(state): State<ServiceState>,
    Json(request): Json<PostTransferHttpRequest>,
) -> Result<Json<PostTransferResponse>, ApiError> {
    let tx_id = with_deadline(
        TRANSFER_POST_DEADLINE,
        post_transfer(
            state.storage.as_ref(),
            TransferRequest {
                from_account_id: request.from_account_id,
                to_account_id: request.to_account_id,
                amount_cents: request.amount_cents,
                currency: request.currency,
                external_ref: request.external_ref,
                idempotency_key: request.idempotency_key,
                correlation_id: request.correlation_id,
            },
        ),
    )
    .await?;
    Ok(Json(PostTransferResponse { tx_id }))
}

async fn verify(State(state): State<ServiceState>) -> Result<Json<VerifyReport>, ApiError> {
    Ok(Json(verify_chain(state.storage.as_ref()).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ValuationSnapshotRequest {
    ingestion_correlation_id: String,
    asset_type: String,
    asset_id: String,
    as_of: chrono::DateTime<chrono::Utc>,
    price: Decimal,
    currency: String,
    source: String,
    confidence: u8,
}

#[derive(Debug, Clone, Serialize)]
struct SnapshotResponse {
    snapshot_id: Uuid,
}

async fn record_valuation(
    State(state): State<ServiceState>,
    Json(request): Json<ValuationSnapshotRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let snapshot_id = record_valuation_snapshot(
        state.storage.as_ref(),
        ValuationInput {
            ingestion_correlation_id: request.ingestion_correlation_id,
            asset_type: request.asset_type,
            asset_id: request.asset_id,
            as_of: request.as_of,
            price: request.price,
            currency: request.currency,
            source: request.source,
            confidence: request.confidence,
        },
    )
    .await?;
    Ok(Json(SnapshotResponse { snapshot_id }))
}

#[derive(Debug, Clone, Deserialize)]
struct LiquiditySnapshotRequest {
    ingestion_correlation_id: String,
    asset_type: String,
    asset_id: String,
    as_of: chrono::DateTime<chrono::Utc>,
    haircut_bps: u16,
    time_to_cash_seconds: i64,
    source: String,
}

async fn record_liquidity(
    State(state): State<ServiceState>,
    Json(request): Json<LiquiditySnapshotRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let snapshot_id = record_liquidity_snapshot(
        state.storage.as_ref(),
        LiquidityInput {
            ingestion_correlation_id: request.ingestion_correlation_id,
            asset_type: request.asset_type,
            asset_id: request.asset_id,
            as_of: request.as_of,
            haircut_bps: request.haircut_bps,
            time_to_cash_seconds: request.time_to_cash_seconds,
            source: request.source,
        },
    )
    .await?;
    Ok(Json(SnapshotResponse { snapshot_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> ServiceState {
        ServiceState::bootstrap(ServiceConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn health_reports_memory_backend() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ledger_backend"], "memory");
    }

    #[tokio::test]
    async fn create_account_then_post_transfer_then_balance() {
        let app = build_router(test_state().await);

        let create = |label: &str| {
            serde_json::json!({"label": label, "currency": "usd"})
        };

        let resp_a = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/accounts")
                    .header("content-type", "application/json")
                    .body(Body::from(create("alice").to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp_a.status(), StatusCode::OK);
        let bytes = to_bytes(resp_a.into_body(), usize::MAX).await.unwrap();
        let account_a: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let account_a_id = account_a["account_id"].as_str().unwrap().to_string();

        let resp_b = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/accounts")
                    .header("content-type", "application/json")
                    .body(Body::from(create("bob").to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(resp_b.into_body(), usize::MAX).await.unwrap();
        let account_b: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let account_b_id = account_b["account_id"].as_str().unwrap().to_string();

        let transfer = serde_json::json!({
            "from_account_id": account_a_id,
            "to_account_id": account_b_id,
            "amount_cents": 1500,
            "currency": "USD",
            "external_ref": "ext-1",
            "idempotency_key": "idem-1",
            "correlation_id": "corr-1",
        });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/transfers")
                    .header("content-type", "application/json")
                    .body(Body::from(transfer.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/accounts/{account_b_id}/balance"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["balance_cents"], 1500);
    }

    #[tokio::test]
    async fn verify_endpoint_reports_ok_on_empty_chain() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/v1/verify").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: VerifyReport = serde_json::from_slice(&bytes).unwrap();
        assert!(body.ok);
    }

    #[tokio::test]
    async fn balance_for_unknown_account_is_404() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/accounts/{}/balance", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
