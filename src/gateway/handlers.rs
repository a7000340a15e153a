//! Gateway handlers.

use axum::Json;
use axum::extract::State;
use axum::response::Response;

use crate::dispatch::payload::RawWebhook;
use crate::store::webhook_log;

use super::state::AppState;
use super::types::{ApiError, HealthResponse, WebhookResponse};

/// Webhook ingress.
///
/// POST /webhook
///
/// Validation order: schema (serde) -> token auth -> symbol check ->
/// dispatch. MARKET / CANCEL_ALL_ORDER complete before the response;
/// LIMIT / STOP are acknowledged with 202 and dispatched in background.
#[utoipa::path(
    post,
    path = "/webhook",
    request_body = RawWebhook,
    responses(
        (status = 200, description = "Fast-path dispatch completed (body carries the per-account summary, including partial failures)", body = WebhookResponse),
        (status = 202, description = "Slow-path orders accepted for background dispatch", body = WebhookResponse),
        (status = 400, description = "Schema or symbol violation", body = super::types::ErrorBody),
        (status = 401, description = "Unknown group or rejected token", body = super::types::ErrorBody),
        (status = 409, description = "Duplicate idempotency key", body = super::types::ErrorBody),
        (status = 429, description = "Exchange throttling exhausted retries", body = super::types::ErrorBody),
        (status = 500, description = "Unhandled internal error", body = super::types::ErrorBody)
    ),
    tag = "Webhook"
)]
pub async fn post_webhook(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    // Manual deserialization keeps schema violations on the documented
    // 400 (axum's typed Json rejects with 422).
    let raw: RawWebhook = match serde_json::from_value(body) {
        Ok(raw) => raw,
        Err(e) => {
            let err = crate::error::RouterError::InvalidPayload(e.to_string());
            let _ = webhook_log::insert(
                &state.db,
                &serde_json::json!({"schema_error": e.to_string()}),
                "rejected",
                Some(&err.to_string()),
            )
            .await;
            return Err(err.into());
        }
    };
    let payload_json = serde_json::to_value(RedactedWebhook::from(&raw))
        .unwrap_or_else(|_| serde_json::json!({}));

    match state.dispatcher.handle(&raw).await {
        Ok(summary) => {
            let message = format!(
                "accepted={} failed={} queued={}",
                summary.accepted, summary.failed, summary.queued
            );
            let status = if summary.failed > 0 { "partial" } else { "ok" };
            let _ = webhook_log::insert(&state.db, &payload_json, status, Some(&message)).await;
            Ok(WebhookResponse::into_response(summary))
        }
        Err(e) => {
            let _ =
                webhook_log::insert(&state.db, &payload_json, "rejected", Some(&e.to_string()))
                    .await;
            Err(e.into())
        }
    }
}

/// Audit copy of the payload with the token stripped.
#[derive(serde::Serialize)]
struct RedactedWebhook {
    group_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_type: Option<crate::core_types::OrderType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qty_per: Option<rust_decimal::Decimal>,
    orders: usize,
}

impl From<&RawWebhook> for RedactedWebhook {
    fn from(raw: &RawWebhook) -> Self {
        Self {
            group_name: raw.group_name.clone(),
            symbol: raw.symbol.clone(),
            order_type: raw.order_type,
            qty_per: raw.qty_per,
            orders: raw.orders.as_ref().map(|o| o.len()).unwrap_or(0),
        }
    }
}

/// Health endpoint
///
/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    ),
    tag = "Ops"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = state.db.health_check().await.is_ok();
    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        db_ok,
        cached_prices: state.price_cache.len(),
    })
}
