//! Axum transport adapter. Routes are thin: authenticate, validate, call
//! into the store, and map component errors to one JSON error shape.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{Authenticator, Principal};
use crate::batch::{BatchCoordinator, BatchOutcome};
use crate::checkout::CheckoutClient;
use crate::config::LemonSqueezyConfig;
use crate::error::GatewayError;
use crate::event::{EventValidator, RawEvent, new_event_uid};
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    auth: Arc<Authenticator>,
    validator: Arc<EventValidator>,
    store: Arc<SqliteStore>,
    batch: Arc<BatchCoordinator>,
    lemon_squeezy: LemonSqueezyConfig,
    checkout_base_url: Option<String>,
}

impl AppState {
    pub fn new(
        auth: Arc<Authenticator>,
        validator: Arc<EventValidator>,
        store: Arc<SqliteStore>,
        lemon_squeezy: LemonSqueezyConfig,
    ) -> Self {
        let batch = Arc::new(BatchCoordinator::new(
            Arc::clone(&validator),
            Arc::clone(&store),
        ));
        Self {
            auth,
            validator,
            store,
            batch,
            lemon_squeezy,
            checkout_base_url: None,
        }
    }

    /// Points the checkout client at a different host. Test hook.
    pub fn with_checkout_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.checkout_base_url = Some(base_url.into());
        self
    }

    fn checkout_client(&self) -> Result<CheckoutClient, GatewayError> {
        let mut client = CheckoutClient::new(&self.lemon_squeezy).map_err(GatewayError::from)?;
        if let Some(base_url) = &self.checkout_base_url {
            client = client.with_base_url(base_url.clone());
        }
        Ok(client)
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    /// `None` when the event was a duplicate already on record.
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
    url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/events", post(submit_event))
        .route("/v1/events/batch", post(submit_batch))
        .route("/v1/checkout", post(create_checkout))
        .with_state(state)
}

type Rejection = (StatusCode, Json<ErrorResponse>);

fn reject(err: impl Into<GatewayError>) -> Rejection {
    let err = err.into();
    let status = StatusCode::from_u16(err.code().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            kind: err.kind(),
            message: err.to_string(),
        }),
    )
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

async fn caller(
    state: &AppState,
    operation: &str,
    headers: &HeaderMap,
) -> Result<Option<Principal>, Rejection> {
    state
        .auth
        .authenticate(operation, bearer(headers))
        .await
        .map_err(reject)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn submit_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<RawEvent>,
) -> Result<Json<SubmitResponse>, Rejection> {
    let principal = caller(&state, "v1/events", &headers).await?;
    let event = state.validator.validate(&raw).await.map_err(reject)?;
    let uid = raw.event_id.clone().unwrap_or_else(new_event_uid);
    let id = state
        .store
        .insert_event(&event, principal.as_ref().map(|p| p.api_key_id.as_str()), &uid)
        .await
        .map_err(reject)?;
    Ok(Json(SubmitResponse { id }))
}

async fn submit_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw_events): Json<Vec<RawEvent>>,
) -> Result<Json<BatchOutcome>, Rejection> {
    let principal = caller(&state, "v1/events/batch", &headers).await?;
    let outcome = state.batch.ingest(principal.as_ref(), raw_events).await;
    Ok(Json(outcome))
}

async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, Rejection> {
    caller(&state, "v1/checkout", &headers).await?;
    let client = state.checkout_client().map_err(reject)?;
    let price_cents = state
        .store
        .price(&request.user_id)
        .await
        .map_err(reject)?;
    let url = client
        .create_checkout(&request.user_id, price_cents)
        .await
        .map_err(reject)?;
    Ok(Json(CheckoutResponse { url }))
}
