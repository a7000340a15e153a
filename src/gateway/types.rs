//! Gateway response types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::dispatch::DispatchSummary;
use crate::error::RouterError;

/// Webhook acknowledgment body.
///
/// `accepted`/`failed` count completed fast-path dispatches; `queued`
/// counts LIMIT/STOP dispatches accepted for background execution.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub summary: DispatchSummary,
}

impl WebhookResponse {
    /// 202 when everything was deferred, 200 otherwise (including
    /// partial failure, which the body details).
    pub fn into_response(summary: DispatchSummary) -> Response {
        let deferred_only =
            summary.queued > 0 && summary.accepted == 0 && summary.failed == 0;
        let body = Json(Self {
            status: if deferred_only { "accepted" } else { "ok" },
            summary,
        });
        if deferred_only {
            (StatusCode::ACCEPTED, body).into_response()
        } else {
            (StatusCode::OK, body).into_response()
        }
    }
}

/// JSON error body with a stable code.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Gateway error wrapper so handlers can `?` RouterError.
#[derive(Debug)]
pub struct ApiError(pub RouterError);

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

/// Health probe body.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub db_ok: bool,
    pub cached_prices: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchFailure;

    #[test]
    fn test_deferred_only_is_202() {
        let summary = DispatchSummary {
            accepted: 0,
            failed: 0,
            queued: 2,
            failures: vec![],
        };
        let resp = WebhookResponse::into_response(summary);
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn test_partial_failure_is_200_with_detail() {
        let summary = DispatchSummary {
            accepted: 3,
            failed: 1,
            queued: 0,
            failures: vec![DispatchFailure {
                account_id: 5,
                reason: "rejected".into(),
                exchange_error: Some("bad qty".into()),
            }],
        };
        let resp = WebhookResponse::into_response(summary);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            ApiError(RouterError::TokenRejected).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(RouterError::DuplicateRequest("k".into()))
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(RouterError::InvalidPayload("x".into()))
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(RouterError::UpstreamThrottled).into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
