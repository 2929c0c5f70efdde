//! Thin HTTP adapter (spec §6, "HTTP surface"), feature-gated behind
//! `http`. Each handler deserializes its input, calls exactly one
//! [`crate::api::GatewayContext`] verb, and maps the result to the status
//! codes spec §6 defines -- no business logic lives here, following the
//! pack's `Router::new().route(...).with_state(state)` shape
//! (`lexe-app-lexe-public`'s `node/src/server/mod.rs`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::GatewayContext;
use crate::error::GatewayError;
use crate::model::{Intent, IntentId};

/// Builds the router mounted under `basePath` (default `/api/pay`, spec
/// §6). Callers nest this under their own `Router` at the configured path.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/intents", post(create_intent))
        .route("/intents/:id", get(get_intent))
        .route("/intents/:id/magic-link", post(issue_magic_link))
        .route("/pay/:token", get(redeem_magic_link))
        .route("/status", get(get_status))
        .route("/scan/:id", post(scan_for_payments))
        .with_state(ctx)
}

/// Wraps `{error: string}` for every non-2xx response (spec §6).
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidState(_) | GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Auth(_) => StatusCode::GONE,
            GatewayError::Expired(_) => StatusCode::GONE,
            GatewayError::Transient(_) | GatewayError::Fatal(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Deserialize)]
struct CreateIntentBody {
    #[serde(rename = "amountSats")]
    amount_sats: i64,
    email: Option<String>,
    #[serde(rename = "customerId")]
    customer_id: Option<String>,
    memo: Option<String>,
    #[serde(rename = "expiresInMinutes")]
    expires_in_minutes: Option<i64>,
    #[serde(rename = "requiredConfs")]
    required_confs: Option<i32>,
}

async fn create_intent(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<CreateIntentBody>,
) -> Result<(StatusCode, Json<Intent>), GatewayError> {
    let intent = ctx
        .create_intent(
            body.amount_sats,
            body.required_confs.unwrap_or(ctx.default_required_confs),
            body.expires_in_minutes.unwrap_or(60),
            body.email,
            body.customer_id,
            body.memo,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(intent)))
}

async fn get_intent(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<IntentId>,
) -> Result<Json<Intent>, GatewayError> {
    let intent = ctx
        .storage
        .get_intent(id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("intent {id} not found")))?;
    Ok(Json(intent))
}

#[derive(Deserialize)]
struct MagicLinkBody {
    #[serde(rename = "ttlHours")]
    ttl_hours: Option<i64>,
}

async fn issue_magic_link(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<IntentId>,
    Json(body): Json<MagicLinkBody>,
) -> Result<Json<crate::api::IssueTokenResponse>, GatewayError> {
    let ttl_seconds = body.ttl_hours.unwrap_or(24) * 3600;
    let resp = ctx.issue_token(id, ttl_seconds).await?;
    Ok(Json(resp))
}

#[derive(Serialize)]
struct PayPageResponse {
    #[serde(rename = "intentId")]
    intent_id: IntentId,
    address: String,
    bip21: String,
    #[serde(rename = "amountSats")]
    amount_sats: i64,
    #[serde(rename = "expiresAt", with = "time::serde::rfc3339")]
    expires_at: time::OffsetDateTime,
    status: crate::model::IntentStatus,
}

/// The one opaque failure `/pay/:token` ever returns (spec §7): whether the
/// signature, the stored row, or the expiry check failed is never leaked.
fn invalid_or_expired_link() -> GatewayError {
    GatewayError::Auth("Invalid or expired link".to_string())
}

async fn redeem_magic_link(
    State(ctx): State<Arc<GatewayContext>>,
    Path(token): Path<String>,
) -> Result<Json<PayPageResponse>, GatewayError> {
    let redeemed = ctx.redeem_token(&token).await.map_err(|_| invalid_or_expired_link())?;
    let assigned = ctx
        .ensure_assigned(redeemed.intent_id)
        .await
        .map_err(|_| invalid_or_expired_link())?;
    Ok(Json(PayPageResponse {
        intent_id: redeemed.intent_id,
        address: assigned.address,
        bip21: assigned.bip21,
        amount_sats: assigned.amount_sats,
        expires_at: assigned.expires_at,
        status: assigned.status,
    }))
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(rename = "intentId")]
    intent_id: IntentId,
}

async fn get_status(
    State(ctx): State<Arc<GatewayContext>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<crate::api::StatusResponse>, GatewayError> {
    let status = ctx.get_status(query.intent_id).await?;
    Ok(Json(status))
}

#[derive(Serialize)]
struct ScanResponse {
    success: bool,
}

async fn scan_for_payments(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<IntentId>,
) -> Result<Json<ScanResponse>, GatewayError> {
    if ctx.scan.is_none() {
        return Err(GatewayError::Transient("watcher is not running".to_string()));
    }
    ctx.scan_for_payments(id).await?;
    Ok(Json(ScanResponse { success: true }))
}
