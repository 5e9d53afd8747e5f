//! Payment orchestrator REST API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tiba_core::PhoneNumber;
use tracing::error;

use crate::callbacks::CallbackReceiver;
use crate::error::PaymentError;
use crate::model::{
    CallbackEvent, ChargeRequest, PayableRef, PayableType, Payer, PaymentHandle, PaymentIntent,
    Rail, ReconcileOutcome,
};
use crate::orchestrator::PaymentOrchestrator;
use crate::rails::ConnectionCheck;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PaymentOrchestrator,
    pub callbacks: CallbackReceiver,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn create_router(orchestrator: PaymentOrchestrator) -> Router {
    let state = AppState {
        callbacks: CallbackReceiver::new(orchestrator.clone()),
        orchestrator,
    };

    Router::new()
        // Health
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        // Payments
        .route("/v1/payments", post(charge))
        .route("/v1/payments/{key}", get(get_status))
        .route("/v1/payments/{key}/poll", post(poll_status))
        .route("/v1/payments/{key}/cancel", post(cancel))
        .route("/v1/payments/{key}/refund", post(refund))
        .route("/v1/payments/{key}/events", get(events))
        // Rail notifications
        .route("/v1/callbacks/mpesa", post(mpesa_callback))
        .route("/v1/callbacks/pesapal", post(pesapal_ipn_post).get(pesapal_ipn_get))
        // Operator tooling
        .route("/v1/rails/{rail}/check", get(check_rail))
        .with_state(state)
}

async fn health() -> &'static str { "OK" }

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let rails = state.orchestrator.rails().enabled();
    let store_healthy = state.orchestrator.store().is_healthy().await;
    let ready = store_healthy && !rails.is_empty();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "ready": ready,
            "store": store_healthy,
            "rails": rails,
        })),
    )
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.metrics().snapshot())
}

fn reject(e: PaymentError) -> ApiError {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }
    (
        status,
        Json(json!({ "code": e.error_code(), "message": e.to_string() })),
    )
}

// Payment endpoints

#[derive(Debug, Deserialize)]
struct ChargeBody {
    payable_type: PayableType,
    payable_id: i64,
    provider_id: i64,
    payer_id: i64,
    amount: Decimal,
    #[serde(default = "default_currency")]
    currency: String,
    rail: Rail,
    phone: Option<String>,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    ledger_address: Option<String>,
    description: Option<String>,
    #[serde(default)]
    metadata: Value,
}

fn default_currency() -> String {
    "KES".to_string()
}

impl ChargeBody {
    fn into_request(self) -> ChargeRequest {
        let payable = PayableRef::new(self.payable_type, self.payable_id);
        ChargeRequest {
            description: self
                .description
                .unwrap_or_else(|| format!("Payment for {payable}")),
            payable,
            provider_id: self.provider_id,
            payer: Payer {
                id: self.payer_id,
                phone: self.phone.as_deref().map(PhoneNumber::new),
                email: self.email,
                first_name: self.first_name,
                last_name: self.last_name,
                ledger_address: self.ledger_address,
            },
            amount: self.amount,
            currency: self.currency.trim().to_uppercase(),
            rail: self.rail,
            metadata: self.metadata,
        }
    }
}

async fn charge(
    State(state): State<AppState>,
    Json(body): Json<ChargeBody>,
) -> Result<(StatusCode, Json<PaymentHandle>), ApiError> {
    let handle = state
        .orchestrator
        .charge(body.into_request())
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(handle)))
}

async fn get_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<PaymentIntent> {
    state.orchestrator.get_status(&key).await.map(Json).map_err(reject)
}

#[derive(Serialize)]
struct PollResponse {
    intent: PaymentIntent,
    outcome: &'static str,
}

fn outcome_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Applied { .. } => "applied",
        ReconcileOutcome::AlreadyTerminal(_) => "already_terminal",
        ReconcileOutcome::Unresolved => "unresolved",
        ReconcileOutcome::Orphan => "orphan",
    }
}

async fn poll_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<PollResponse> {
    let (intent, outcome) = state.orchestrator.poll_status(&key).await.map_err(reject)?;
    Ok(Json(PollResponse {
        intent,
        outcome: outcome_label(&outcome),
    }))
}

async fn cancel(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<PaymentIntent> {
    state.orchestrator.cancel(&key).await.map(Json).map_err(reject)
}

#[derive(Deserialize)]
struct RefundBody {
    authorized_by: String,
}

async fn refund(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<RefundBody>,
) -> ApiResult<PaymentIntent> {
    state
        .orchestrator
        .refund(&key, &body.authorized_by)
        .await
        .map(Json)
        .map_err(reject)
}

async fn events(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Vec<CallbackEvent>> {
    state.orchestrator.events(&key).await.map(Json).map_err(reject)
}

// Callbacks

async fn mpesa_callback(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Value> {
    let ack = state.callbacks.handle_mpesa(payload).await.map_err(reject)?;
    Ok(Json(ack.body))
}

async fn pesapal_ipn_post(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Value> {
    let ack = state.callbacks.handle_pesapal(payload).await.map_err(reject)?;
    Ok(Json(ack.body))
}

async fn pesapal_ipn_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let payload = Value::Object(
        params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    let ack = state.callbacks.handle_pesapal(payload).await.map_err(reject)?;
    Ok(Json(ack.body))
}

// Operator tooling

async fn check_rail(
    State(state): State<AppState>,
    Path(rail): Path<String>,
) -> ApiResult<ConnectionCheck> {
    let rail = Rail::from_str(&rail).map_err(|e| reject(PaymentError::Validation(e)))?;
    let adapter = state.orchestrator.rails().get(rail).map_err(reject)?;
    adapter.check_connection().await.map(Json).map_err(reject)
}
