//! Router error types.
//!
//! `ExchangeError` is the failure taxonomy every adapter surfaces upward;
//! `RouterError` is the webhook-facing error with stable codes and HTTP
//! status suggestions.

use thiserror::Error;

/// Failure taxonomy surfaced by exchange adapters.
///
/// The dispatcher and reconciler branch on these variants, never on raw
/// exchange payloads.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    /// Terminal rejection at the venue (validation, precision, balance).
    #[error("order rejected by exchange: {0}")]
    Rejected(String),

    /// HTTP 429 or venue-specific throttle response.
    #[error("throttled by exchange: {0}")]
    Throttled(String),

    /// Connection reset, DNS, timeout. State of the request is unknown;
    /// order creation must be probed with fetch_order, never blind-retried.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials rejected. The owning account gets disabled.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// Order or symbol unknown at the venue.
    #[error("not found: {0}")]
    NotFound(String),

    /// The venue reports a state that conflicts with the request
    /// (e.g. cancel on an already-filled order).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The venue returned a terminal error the adapter cannot classify.
    #[error("unknown terminal exchange error: {0}")]
    UnknownTerminal(String),
}

impl ExchangeError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::Rejected(_) => "REJECTED",
            ExchangeError::Throttled(_) => "THROTTLED",
            ExchangeError::TransientNetwork(_) => "TRANSIENT_NETWORK",
            ExchangeError::AuthError(_) => "AUTH_ERROR",
            ExchangeError::NotFound(_) => "NOT_FOUND",
            ExchangeError::Conflict(_) => "CONFLICT",
            ExchangeError::UnknownTerminal(_) => "UNKNOWN_TERMINAL",
        }
    }

    /// Safe to retry with backoff inside the adapter (idempotent calls only).
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Throttled(_) | ExchangeError::TransientNetwork(_)
        )
    }

    /// The venue will never accept this request; do not probe.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Rejected(_)
                | ExchangeError::AuthError(_)
                | ExchangeError::UnknownTerminal(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ExchangeError::TransientNetwork(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            ExchangeError::Throttled(e.to_string())
        } else {
            ExchangeError::UnknownTerminal(e.to_string())
        }
    }
}

/// Webhook-facing error.
///
/// Error codes and HTTP statuses follow the external contract: 400 for
/// schema/symbol violations, 401 for token, 409 for duplicate idempotency
/// key, 429 for upstream throttling, 500 otherwise.
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    // === Validation ===
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("precision violation: {0}")]
    Precision(String),

    #[error("order below minimum notional")]
    MinNotional,

    #[error("no position to close")]
    NoPositionToClose,

    #[error("price is stale and synchronous refresh failed: {0}")]
    StalePrice(String),

    // === Auth ===
    #[error("strategy group not found: {0}")]
    UnknownGroup(String),

    #[error("webhook token rejected")]
    TokenRejected,

    #[error("strategy is not active")]
    StrategyInactive,

    // === Idempotency ===
    #[error("duplicate idempotency key: {0}")]
    DuplicateRequest(String),

    // === Upstream ===
    #[error("exchange throttled and retries exhausted")]
    UpstreamThrottled,

    // === System ===
    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Stable error code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::InvalidPayload(_) => "INVALID_PAYLOAD",
            RouterError::InvalidSymbol(_) => "INVALID_SYMBOL",
            RouterError::Precision(_) => "PRECISION",
            RouterError::MinNotional => "MIN_NOTIONAL",
            RouterError::NoPositionToClose => "NO_POSITION_TO_CLOSE",
            RouterError::StalePrice(_) => "STALE_PRICE",
            RouterError::UnknownGroup(_) => "UNKNOWN_GROUP",
            RouterError::TokenRejected => "TOKEN_REJECTED",
            RouterError::StrategyInactive => "STRATEGY_INACTIVE",
            RouterError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            RouterError::UpstreamThrottled => "UPSTREAM_THROTTLED",
            RouterError::Database(_) => "DATABASE_ERROR",
            RouterError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code suggestion.
    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::InvalidPayload(_)
            | RouterError::InvalidSymbol(_)
            | RouterError::Precision(_)
            | RouterError::MinNotional
            | RouterError::NoPositionToClose
            | RouterError::StalePrice(_) => 400,
            RouterError::UnknownGroup(_)
            | RouterError::TokenRejected
            | RouterError::StrategyInactive => 401,
            RouterError::DuplicateRequest(_) => 409,
            RouterError::UpstreamThrottled => 429,
            RouterError::Database(_) | RouterError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for RouterError {
    fn from(e: sqlx::Error) -> Self {
        RouterError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_codes() {
        assert_eq!(ExchangeError::Rejected("x".into()).code(), "REJECTED");
        assert_eq!(ExchangeError::Throttled("x".into()).code(), "THROTTLED");
        assert_eq!(ExchangeError::AuthError("x".into()).code(), "AUTH_ERROR");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Throttled("429".into()).is_retryable());
        assert!(ExchangeError::TransientNetwork("reset".into()).is_retryable());
        assert!(!ExchangeError::Rejected("bad px".into()).is_retryable());
        assert!(!ExchangeError::NotFound("gone".into()).is_retryable());
    }

    #[test]
    fn test_router_error_http_status() {
        assert_eq!(RouterError::InvalidPayload("x".into()).http_status(), 400);
        assert_eq!(RouterError::TokenRejected.http_status(), 401);
        assert_eq!(RouterError::DuplicateRequest("k".into()).http_status(), 409);
        assert_eq!(RouterError::UpstreamThrottled.http_status(), 429);
        assert_eq!(RouterError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_no_position_to_close_reason() {
        assert_eq!(
            RouterError::NoPositionToClose.code(),
            "NO_POSITION_TO_CLOSE"
        );
        assert_eq!(RouterError::NoPositionToClose.http_status(), 400);
    }
}
