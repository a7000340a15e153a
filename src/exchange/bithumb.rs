//! Bithumb adapter (KRW spot).
//!
//! JWT-authenticated REST in the Upbit mold, but with `BASE_QUOTE`
//! symbols, no authenticated WebSocket (the poller is the only private
//! feed), and no all-markets ticker — bulk price fetches are chunked at
//! 100 symbols per call to stay URL-length-safe.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::core_types::{ExchangeId, MarketType, OrderStatus, OrderType, Side};
use crate::error::ExchangeError;
use crate::registry::InstrumentMeta;
use crate::symbols;

use super::rate_limit::{PacedLock, TokenBucket};
use super::signing;
use super::ws::WsSession;
use super::{
    AccountCtx, BalanceSnapshot, Capabilities, Deadlines, Exchange, OrderAck, OrderFeedEvent,
    OrderRequest, OrderSnapshot, Quote, classify_http_error, normalize_status, retry_idempotent,
};

const REST: &str = "https://api.bithumb.com";
const WS_PUBLIC: &str = "wss://pubwss.bithumb.com/pub/ws";
/// Max symbols per bulk ticker call.
const BULK_CHUNK: usize = 100;

pub struct Bithumb {
    ctx: AccountCtx,
    http: reqwest::Client,
    deadlines: Deadlines,
    limiter: TokenBucket,
    pacer: PacedLock,
}

fn venue_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "bid",
        Side::Sell => "ask",
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn classify_bithumb_error(status: u16, body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ErrBody {
        error: Option<ErrInner>,
    }
    #[derive(Deserialize)]
    struct ErrInner {
        name: Option<String>,
        message: Option<String>,
    }
    if let Ok(err) = serde_json::from_str::<ErrBody>(body) {
        if let Some(inner) = err.error {
            let name = inner.name.unwrap_or_default();
            let msg = format!("{}: {}", name, inner.message.unwrap_or_default());
            return match name.as_str() {
                "invalid_access_key" | "jwt_verification" => ExchangeError::AuthError(msg),
                "too_many_requests" => ExchangeError::Throttled(msg),
                "order_not_found" => ExchangeError::NotFound(msg),
                "insufficient_funds" | "under_min_total" | "invalid_volume"
                | "invalid_price" => ExchangeError::Rejected(msg),
                _ => classify_http_error(status, &msg),
            };
        }
    }
    classify_http_error(status, body)
}

#[derive(Debug, Deserialize)]
struct RestOrder {
    uuid: String,
    side: String,
    state: String,
    market: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    executed_volume: Option<String>,
}

impl RestOrder {
    fn into_snapshot(self) -> OrderSnapshot {
        OrderSnapshot {
            status: normalize_status(ExchangeId::Bithumb, &self.state)
                .unwrap_or(OrderStatus::Open),
            filled_qty: self.executed_volume.as_deref().map(dec).unwrap_or_default(),
            avg_price: None,
            symbol: symbols::decode(ExchangeId::Bithumb, &self.market),
            side: if self.side == "ask" { Side::Sell } else { Side::Buy },
            price: self.price.as_deref().map(dec).filter(|p| !p.is_zero()),
            qty: self.volume.as_deref().map(dec).unwrap_or_default(),
            exchange_order_id: self.uuid,
        }
    }
}

impl Bithumb {
    pub fn new(ctx: AccountCtx, http: reqwest::Client, deadlines: Deadlines) -> Self {
        Self {
            ctx,
            http,
            deadlines,
            limiter: TokenBucket::new(20, 8.0),
            pacer: PacedLock::per_second(8),
        }
    }

    fn bearer(&self, query: &str) -> String {
        format!(
            "Bearer {}",
            signing::jwt_token(&self.ctx.public_key, &self.ctx.secret_key, query)
        )
    }

    async fn private_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        deadline: Duration,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire().await;
        let url = if query.is_empty() {
            format!("{REST}{path}")
        } else {
            format!("{REST}{path}?{query}")
        };
        let resp = self
            .http
            .request(method, &url)
            .header("Authorization", self.bearer(query))
            .timeout(deadline)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !(200..300).contains(&status) {
            return Err(classify_bithumb_error(status, &body));
        }
        Ok(body)
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<String, ExchangeError> {
        self.limiter.acquire().await;
        let url = if query.is_empty() {
            format!("{REST}{path}")
        } else {
            format!("{REST}{path}?{query}")
        };
        let resp = self
            .http
            .get(&url)
            .timeout(self.deadlines.slow)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !(200..300).contains(&status) {
            return Err(classify_bithumb_error(status, &body));
        }
        Ok(body)
    }

    fn order_query(req: &OrderRequest) -> Result<String, ExchangeError> {
        let market = symbols::encode(ExchangeId::Bithumb, &req.symbol);
        let side = venue_side(req.side);
        match req.order_type {
            OrderType::Limit => {
                let price = req
                    .price
                    .ok_or_else(|| ExchangeError::Rejected("price required".into()))?;
                Ok(signing::query_string(&[
                    ("market", market),
                    ("side", side.to_string()),
                    ("volume", req.qty.normalize().to_string()),
                    ("price", price.normalize().to_string()),
                    ("ord_type", "limit".to_string()),
                ]))
            }
            OrderType::Market => match req.side {
                Side::Buy => {
                    let ref_price = req.ref_price.ok_or_else(|| {
                        ExchangeError::Rejected("market buy needs a reference price".into())
                    })?;
                    let notional = (req.qty * ref_price).normalize();
                    Ok(signing::query_string(&[
                        ("market", market),
                        ("side", side.to_string()),
                        ("price", notional.to_string()),
                        ("ord_type", "price".to_string()),
                    ]))
                }
                Side::Sell => Ok(signing::query_string(&[
                    ("market", market),
                    ("side", side.to_string()),
                    ("volume", req.qty.normalize().to_string()),
                    ("ord_type", "market".to_string()),
                ])),
            },
            OrderType::StopMarket | OrderType::StopLimit => Err(ExchangeError::Rejected(
                "bithumb does not support stop orders".into(),
            )),
            OrderType::CancelAllOrder => Err(ExchangeError::Rejected(
                "CANCEL_ALL_ORDER is not a placement type".into(),
            )),
        }
    }

    /// Split a symbol list into URL-safe chunks.
    fn chunk_markets(syms: &[String]) -> Vec<Vec<String>> {
        syms.chunks(BULK_CHUNK)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|s| symbols::encode(ExchangeId::Bithumb, s))
                    .collect()
            })
            .collect()
    }
}

// === WS payload parsing ===

/// Public ticker frames.
pub(crate) fn parse_ticker(text: &str) -> Vec<Quote> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    if v.get("type").and_then(|t| t.as_str()) != Some("ticker") {
        return Vec::new();
    }
    let Some(content) = v.get("content") else {
        return Vec::new();
    };
    let Some(symbol) = content.get("symbol").and_then(|s| s.as_str()) else {
        return Vec::new();
    };
    let Some(price) = content.get("closePrice").and_then(|p| p.as_str()) else {
        return Vec::new();
    };
    vec![Quote {
        symbol: symbols::decode(ExchangeId::Bithumb, symbol),
        price: dec(price),
    }]
}

#[async_trait]
impl Exchange for Bithumb {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bithumb
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_futures: false,
            supports_leverage: false,
            supports_batch: false,
            supports_private_ws: false,
            bulk_price_all: false,
            bulk_chunk: BULK_CHUNK,
            orders_per_sec: 8,
        }
    }

    async fn fetch_balance(&self, _market: MarketType) -> Result<BalanceSnapshot, ExchangeError> {
        #[derive(Deserialize)]
        struct AccountEntry {
            currency: String,
            balance: String,
            locked: String,
        }
        let body = retry_idempotent(3, || {
            self.private_request(reqwest::Method::GET, "/v1/accounts", "", self.deadlines.slow)
        })
        .await?;
        let entries: Vec<AccountEntry> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        let krw = entries.iter().find(|e| e.currency == "KRW");
        let free = krw.map(|e| dec(&e.balance)).unwrap_or_default();
        let used = krw.map(|e| dec(&e.locked)).unwrap_or_default();
        Ok(BalanceSnapshot {
            free,
            used,
            total: free + used,
        })
    }

    async fn fetch_price(&self, symbol: &str, market: MarketType) -> Result<Quote, ExchangeError> {
        let quotes = self
            .fetch_prices_bulk(Some(std::slice::from_ref(&symbol.to_string())), market)
            .await?;
        quotes
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {symbol}")))
    }

    async fn fetch_prices_bulk(
        &self,
        symbols_filter: Option<&[String]>,
        _market: MarketType,
    ) -> Result<Vec<Quote>, ExchangeError> {
        #[derive(Deserialize)]
        struct Ticker {
            market: String,
            trade_price: f64,
        }
        let targets: Vec<String> = match symbols_filter {
            Some(list) => list.to_vec(),
            None => self
                .fetch_instruments(MarketType::Spot)
                .await?
                .into_iter()
                .map(|m| m.symbol)
                .collect(),
        };

        let mut quotes = Vec::with_capacity(targets.len());
        for chunk in Self::chunk_markets(&targets) {
            let query = format!("markets={}", chunk.join(","));
            let body = retry_idempotent(3, || self.public_get("/v1/ticker", &query)).await?;
            let tickers: Vec<Ticker> = serde_json::from_str(&body)
                .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
            quotes.extend(tickers.into_iter().map(|t| Quote {
                symbol: symbols::decode(ExchangeId::Bithumb, &t.market),
                price: Decimal::from_f64_retain(t.trade_price).unwrap_or_default(),
            }));
        }
        Ok(quotes)
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let query = Self::order_query(req)?;
        let deadline = if req.order_type.is_fast_path() {
            self.deadlines.fast
        } else {
            self.deadlines.slow
        };
        let _pace = self.pacer.acquire().await;
        let body = self
            .private_request(reqwest::Method::POST, "/v1/orders", &query, deadline)
            .await?;
        let order: RestOrder = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        let snap = order.into_snapshot();
        Ok(OrderAck {
            exchange_order_id: snap.exchange_order_id,
            status: snap.status,
            filled_qty: snap.filled_qty,
            avg_price: snap.avg_price,
        })
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<(), ExchangeError> {
        let query = format!("uuid={exchange_order_id}");
        retry_idempotent(3, || {
            self.private_request(
                reqwest::Method::DELETE,
                "/v1/order",
                &query,
                self.deadlines.fast,
            )
        })
        .await?;
        Ok(())
    }

    async fn cancel_all(
        &self,
        symbol: &str,
        side: Option<Side>,
        market: MarketType,
    ) -> Result<Vec<String>, ExchangeError> {
        let open = self.fetch_open_orders(Some(symbol), market).await?;
        let mut cancelled = Vec::new();
        for order in open {
            if let Some(s) = side {
                if order.side != s {
                    continue;
                }
            }
            match self
                .cancel_order(&order.exchange_order_id, symbol, market)
                .await
            {
                Ok(()) => cancelled.push(order.exchange_order_id),
                Err(ExchangeError::NotFound(_)) | Err(ExchangeError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        _market: MarketType,
    ) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let mut params = vec![("state", "wait".to_string())];
        if let Some(sym) = symbol {
            params.push(("market", symbols::encode(ExchangeId::Bithumb, sym)));
        }
        let query = signing::query_string(&params);
        let body = retry_idempotent(3, || {
            self.private_request(reqwest::Method::GET, "/v1/orders", &query, self.deadlines.slow)
        })
        .await?;
        let orders: Vec<RestOrder> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(orders.into_iter().map(RestOrder::into_snapshot).collect())
    }

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let query = format!("uuid={exchange_order_id}");
        let body = retry_idempotent(3, || {
            self.private_request(reqwest::Method::GET, "/v1/order", &query, self.deadlines.slow)
        })
        .await?;
        let order: RestOrder = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(order.into_snapshot())
    }

    async fn fetch_recent_fills(
        &self,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError> {
        // No separate executions endpoint; order snapshots carry fills.
        Ok(Vec::new())
    }

    async fn fetch_instruments(
        &self,
        _market: MarketType,
    ) -> Result<Vec<InstrumentMeta>, ExchangeError> {
        #[derive(Deserialize)]
        struct Market {
            market: String,
        }
        let body = retry_idempotent(3, || self.public_get("/v1/market/all", "")).await?;
        let markets: Vec<Market> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(markets
            .into_iter()
            .filter(|m| m.market.ends_with("_KRW"))
            .map(|m| InstrumentMeta {
                symbol: symbols::decode(ExchangeId::Bithumb, &m.market),
                tick_size: Decimal::ZERO,
                step_size: dec("0.00000001"),
                min_qty: Decimal::ZERO,
                min_notional: dec("5000"),
                supports_futures: false,
                supports_perpetual: false,
                max_leverage: 1,
            })
            .collect())
    }

    async fn ws_subscribe_public_prices(
        &self,
        syms: Vec<String>,
        _market: MarketType,
        tx: mpsc::Sender<Quote>,
    ) {
        let codes: Vec<String> = syms
            .iter()
            .map(|s| symbols::encode(ExchangeId::Bithumb, s))
            .collect();
        let frame = json!({
            "type": "ticker",
            "symbols": codes,
            "tickTypes": ["24H"],
        });
        let session = WsSession {
            name: "bithumb-public".to_string(),
            url: WS_PUBLIC.to_string(),
            headers: Vec::new(),
            subscribe_frames: vec![frame.to_string()],
            ping_interval: Duration::from_secs(60),
        };
        session.run(parse_ticker, tx).await;
    }

    async fn ws_subscribe_private_orders(
        &self,
        _market: MarketType,
        _tx: mpsc::Sender<OrderFeedEvent>,
    ) {
        // No authenticated WS; the REST poller is the private feed here.
        info!("bithumb has no private order stream; relying on poller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    #[test]
    fn test_chunking_445_symbols_makes_5_calls() {
        let syms: Vec<String> = (0..445).map(|i| format!("C{i}/KRW")).collect();
        let chunks = Bithumb::chunk_markets(&syms);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[4].len(), 45);
        assert_eq!(chunks[0][0], "C0_KRW");
    }

    #[test]
    fn test_parse_ticker() {
        let frame = r#"{"type":"ticker","content":{"symbol":"BTC_KRW","closePrice":"70120000","chgRate":"0.5"}}"#;
        let quotes = parse_ticker(frame);
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].symbol, "BTC/KRW");
        assert_eq!(quotes[0].price, d!(70120000));

        assert!(parse_ticker(r#"{"status":"0000","resmsg":"Connected"}"#).is_empty());
    }

    #[test]
    fn test_market_buy_notional() {
        let req = OrderRequest {
            symbol: "BTC/KRW".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: d!(0.01),
            price: None,
            stop_price: None,
            ref_price: Some(d!(70000000)),
            client_order_id: None,
            market: MarketType::Spot,
            reduce_only: false,
        };
        let query = Bithumb::order_query(&req).unwrap();
        assert!(query.contains("market=BTC_KRW"));
        assert!(query.contains("ord_type=price"));
        assert!(query.contains("price=700000"));
    }

    #[test]
    fn test_stop_rejected() {
        let req = OrderRequest {
            symbol: "BTC/KRW".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopLimit,
            qty: d!(0.01),
            price: Some(d!(1)),
            stop_price: Some(d!(1)),
            ref_price: None,
            client_order_id: None,
            market: MarketType::Spot,
            reduce_only: false,
        };
        assert!(Bithumb::order_query(&req).is_err());
    }
}
