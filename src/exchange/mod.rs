//! Exchange adapter layer.
//!
//! One uniform async interface over heterogeneous venue APIs. Variants:
//! Binance (spot+futures), Bybit (spot+linear), Upbit (spot), Bithumb
//! (spot). Adapters normalize symbols, order statuses, and errors; a
//! per-variant token bucket guards all REST and a pacing lock serializes
//! order bursts on venues without native batch endpoints.

pub mod binance;
pub mod bithumb;
pub mod bybit;
#[cfg(feature = "mock-exchange")]
pub mod mock;
pub mod rate_limit;
pub mod signing;
pub mod upbit;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::core_types::{AccountId, ExchangeId, MarketType, OrderStatus, OrderType, Side};
use crate::error::ExchangeError;
use crate::registry::InstrumentMeta;

/// Opaque credentials handed to an adapter. Decryption happens before the
/// core ever sees them.
#[derive(Debug, Clone)]
pub struct AccountCtx {
    pub account_id: AccountId,
    pub public_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
    pub testnet: bool,
}

/// Venue balance snapshot in the venue's quote currency.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceSnapshot {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// A last-trade quote.
#[derive(Debug, Clone)]
pub struct Quote {
    /// Canonical symbol.
    pub symbol: String,
    pub price: Decimal,
}

/// Order placement request, already sized and rounded.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Canonical symbol.
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Last trade price at sizing time. Venues that express market buys
    /// in quote notional (Upbit, Bithumb) convert with this.
    pub ref_price: Option<Decimal>,
    /// Client order id sent to the venue; lets a create-timeout be
    /// resolved by probe instead of a blind retry.
    pub client_order_id: Option<String>,
    pub market: MarketType,
    /// Reduce-only flag for futures liquidation orders.
    pub reduce_only: bool,
}

/// Exchange acknowledgment of an order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// One normalized order snapshot (fetch_order / fetch_open_orders).
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Normalized private-feed execution event, shared by WS and poller paths.
#[derive(Debug, Clone)]
pub struct OrderFeedEvent {
    pub exchange_order_id: String,
    /// Canonical symbol.
    pub symbol: String,
    pub status: OrderStatus,
    /// Cumulative filled quantity.
    pub filled_qty: Decimal,
    /// Quantity of this execution, zero for pure status changes.
    pub last_fill_qty: Decimal,
    pub last_fill_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    /// Exchange-assigned execution sequence (trade id). Zero for status
    /// snapshots, which lets WS and poller deliveries of the same fill
    /// collide on the trades unique index.
    pub fill_seq: i64,
}

/// Result of a batch placement.
#[derive(Debug)]
pub struct BatchResult {
    pub results: Vec<Result<OrderAck, ExchangeError>>,
}

impl BatchResult {
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.successful()
    }
}

/// Static capability set of a variant. Callers query capability before
/// invoking optional methods.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_futures: bool,
    pub supports_leverage: bool,
    /// Venue offers a native batch-order endpoint.
    pub supports_batch: bool,
    /// Venue offers an authenticated order WebSocket.
    pub supports_private_ws: bool,
    /// Venue offers an "all markets" bulk ticker endpoint.
    pub bulk_price_all: bool,
    /// Max symbols per bulk ticker call when chunking is required.
    pub bulk_chunk: usize,
    /// Order-rate ceiling (orders per second) for serialized batches.
    pub orders_per_sec: u32,
}

/// Uniform interface over venue REST + WS APIs.
///
/// All quantities and prices are `Decimal` in canonical units; symbols
/// are canonical `BASE/QUOTE`. Encoding to venue wire forms happens
/// inside the adapter.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> ExchangeId;

    fn capabilities(&self) -> Capabilities;

    /// Quote-currency balance for the market segment.
    async fn fetch_balance(&self, market: MarketType) -> Result<BalanceSnapshot, ExchangeError>;

    /// Last trade price of one symbol (also warms the price cache upstream).
    async fn fetch_price(&self, symbol: &str, market: MarketType) -> Result<Quote, ExchangeError>;

    /// Bulk last-trade prices. `symbols == None` means "all markets" when
    /// the venue supports it; otherwise adapters chunk requests to stay
    /// URL-length-safe.
    async fn fetch_prices_bulk(
        &self,
        symbols: Option<&[String]>,
        market: MarketType,
    ) -> Result<Vec<Quote>, ExchangeError>;

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Place a batch. The default implementation serializes single calls
    /// under the adapter's pacing lock, honoring the venue's order-rate
    /// ceiling; variants with a native endpoint override it.
    async fn create_batch_orders(&self, reqs: &[OrderRequest]) -> BatchResult {
        let mut results = Vec::with_capacity(reqs.len());
        for req in reqs {
            results.push(self.create_order(req).await);
        }
        BatchResult { results }
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<(), ExchangeError>;

    /// Cancel all open orders on a symbol, optionally one side only.
    /// Returns the exchange order ids that were cancelled.
    async fn cancel_all(
        &self,
        symbol: &str,
        side: Option<Side>,
        market: MarketType,
    ) -> Result<Vec<String>, ExchangeError>;

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        market: MarketType,
    ) -> Result<Vec<OrderSnapshot>, ExchangeError>;

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<OrderSnapshot, ExchangeError>;

    /// Probe by client order id after a create timeout. `Ok(None)` means
    /// the venue never saw the order. Venues without client-id lookup
    /// keep the default, which forces the conservative fail path.
    async fn fetch_order_by_client_id(
        &self,
        _client_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        Ok(None)
    }

    /// Recent private executions for the poller; venues that fold fills
    /// into order snapshots may return an empty list.
    async fn fetch_recent_fills(
        &self,
        symbol: &str,
        market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError>;

    /// Futures-only. Variants without leverage return `Rejected`.
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Err(ExchangeError::Rejected(format!(
            "{} does not support leverage",
            self.id()
        )))
    }

    /// Instrument metadata for the registry (boot + periodic refresh).
    async fn fetch_instruments(
        &self,
        market: MarketType,
    ) -> Result<Vec<InstrumentMeta>, ExchangeError>;

    /// Long-running public price stream. Pushes quotes until cancelled;
    /// reconnects internally with backoff.
    async fn ws_subscribe_public_prices(
        &self,
        symbols: Vec<String>,
        market: MarketType,
        tx: mpsc::Sender<Quote>,
    );

    /// Long-running authenticated order stream. Pushes normalized feed
    /// events until cancelled; reconnects internally with backoff.
    /// Variants without a private WS return immediately (poller covers
    /// them).
    async fn ws_subscribe_private_orders(&self, market: MarketType, tx: mpsc::Sender<OrderFeedEvent>);
}

/// Map a venue's raw order-status string to the standard vocabulary.
///
/// | Exchange | Raw | Standard |
/// |---|---|---|
/// | BINANCE | NEW/PARTIALLY_FILLED/FILLED/CANCELED/EXPIRED/REJECTED | NEW/PARTIALLY_FILLED/FILLED/CANCELLED/CANCELLED/FAILED |
/// | BYBIT | Created/New/PartiallyFilled/Filled/Cancelled/Rejected | NEW/NEW/PARTIALLY_FILLED/FILLED/CANCELLED/FAILED |
/// | UPBIT | wait/done/cancel | OPEN/FILLED/CANCELLED |
/// | BITHUMB | bid/fill/cancel | OPEN/FILLED/CANCELLED |
pub fn normalize_status(exchange: ExchangeId, raw: &str) -> Option<OrderStatus> {
    match exchange {
        ExchangeId::Binance => match raw {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "EXPIRED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Failed),
            _ => None,
        },
        ExchangeId::Bybit => match raw {
            "Created" | "New" => Some(OrderStatus::New),
            "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
            "Filled" => Some(OrderStatus::Filled),
            "Cancelled" => Some(OrderStatus::Cancelled),
            "Rejected" => Some(OrderStatus::Failed),
            _ => None,
        },
        ExchangeId::Upbit => match raw {
            "wait" => Some(OrderStatus::Open),
            "done" => Some(OrderStatus::Filled),
            "cancel" => Some(OrderStatus::Cancelled),
            _ => None,
        },
        ExchangeId::Bithumb => match raw {
            "bid" => Some(OrderStatus::Open),
            "fill" => Some(OrderStatus::Filled),
            "cancel" => Some(OrderStatus::Cancelled),
            _ => None,
        },
    }
}

/// Shared HTTP client configuration: one pooled client per process with
/// separate per-call deadlines applied by the adapters.
pub fn build_http_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true)
        .build()
        .expect("reqwest client")
}

/// Per-call deadlines from the concurrency contract.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    /// MARKET / CANCEL fast path.
    pub fast: Duration,
    /// Everything else.
    pub slow: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            slow: Duration::from_secs(30),
        }
    }
}

/// Classify an HTTP error response into the adapter failure taxonomy.
pub fn classify_http_error(status: u16, body: &str) -> ExchangeError {
    match status {
        401 | 403 => ExchangeError::AuthError(truncate(body)),
        404 => ExchangeError::NotFound(truncate(body)),
        409 => ExchangeError::Conflict(truncate(body)),
        418 | 429 => ExchangeError::Throttled(truncate(body)),
        400 | 422 => ExchangeError::Rejected(truncate(body)),
        500..=599 => ExchangeError::TransientNetwork(truncate(body)),
        _ => ExchangeError::UnknownTerminal(truncate(body)),
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 256;
    if s.chars().count() > MAX {
        let cut: String = s.chars().take(MAX).collect();
        format!("{cut}…")
    } else {
        s.to_string()
    }
}

/// Retry an idempotent call up to `attempts` times on throttle/transient
/// failures, with doubling jittered backoff. Order creation must never go
/// through this path; creation timeouts are resolved by a fetch_order
/// probe instead.
pub async fn retry_idempotent<T, Fut>(
    attempts: u32,
    mut op: impl FnMut() -> Fut,
) -> Result<T, ExchangeError>
where
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    use rand::Rng;
    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.2));
                tracing::debug!(error = %e, attempt, "retrying idempotent exchange call");
                tokio::time::sleep(jittered).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build the adapter for one account.
pub fn build_adapter(
    exchange: ExchangeId,
    ctx: AccountCtx,
    http: reqwest::Client,
    deadlines: Deadlines,
) -> Arc<dyn Exchange> {
    match exchange {
        ExchangeId::Binance => Arc::new(binance::Binance::new(ctx, http, deadlines)),
        ExchangeId::Bybit => Arc::new(bybit::Bybit::new(ctx, http, deadlines)),
        ExchangeId::Upbit => Arc::new(upbit::Upbit::new(ctx, http, deadlines)),
        ExchangeId::Bithumb => Arc::new(bithumb::Bithumb::new(ctx, http, deadlines)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table_binance() {
        let ex = ExchangeId::Binance;
        assert_eq!(normalize_status(ex, "NEW"), Some(OrderStatus::New));
        assert_eq!(
            normalize_status(ex, "PARTIALLY_FILLED"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(normalize_status(ex, "FILLED"), Some(OrderStatus::Filled));
        assert_eq!(normalize_status(ex, "CANCELED"), Some(OrderStatus::Cancelled));
        assert_eq!(normalize_status(ex, "EXPIRED"), Some(OrderStatus::Cancelled));
        assert_eq!(normalize_status(ex, "REJECTED"), Some(OrderStatus::Failed));
        assert_eq!(normalize_status(ex, "???"), None);
    }

    #[test]
    fn test_status_table_bybit() {
        let ex = ExchangeId::Bybit;
        assert_eq!(normalize_status(ex, "Created"), Some(OrderStatus::New));
        assert_eq!(normalize_status(ex, "New"), Some(OrderStatus::New));
        assert_eq!(
            normalize_status(ex, "PartiallyFilled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(normalize_status(ex, "Filled"), Some(OrderStatus::Filled));
        assert_eq!(normalize_status(ex, "Cancelled"), Some(OrderStatus::Cancelled));
        assert_eq!(normalize_status(ex, "Rejected"), Some(OrderStatus::Failed));
    }

    #[test]
    fn test_status_table_domestic() {
        assert_eq!(
            normalize_status(ExchangeId::Upbit, "wait"),
            Some(OrderStatus::Open)
        );
        assert_eq!(
            normalize_status(ExchangeId::Upbit, "done"),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            normalize_status(ExchangeId::Upbit, "cancel"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            normalize_status(ExchangeId::Bithumb, "bid"),
            Some(OrderStatus::Open)
        );
        assert_eq!(
            normalize_status(ExchangeId::Bithumb, "fill"),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            normalize_status(ExchangeId::Bithumb, "cancel"),
            Some(OrderStatus::Cancelled)
        );
    }

    #[test]
    fn test_classify_http_error() {
        assert!(matches!(
            classify_http_error(429, "slow down"),
            ExchangeError::Throttled(_)
        ));
        assert!(matches!(
            classify_http_error(401, "bad key"),
            ExchangeError::AuthError(_)
        ));
        assert!(matches!(
            classify_http_error(400, "bad qty"),
            ExchangeError::Rejected(_)
        ));
        assert!(matches!(
            classify_http_error(503, "maintenance"),
            ExchangeError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_http_error(404, "no order"),
            ExchangeError::NotFound(_)
        ));
    }
}
