//! Upbit adapter (KRW spot).
//!
//! Every private request carries a short-lived JWT whose payload hashes
//! the exact query string. Upbit quirks handled here: market buys are
//! expressed in quote notional (`ord_type=price`), market sells in base
//! volume (`ord_type=market`), and the order-rate ceiling is 8/s, so
//! placements are paced at a 125 ms minimum gap.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

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

const REST: &str = "https://api.upbit.com";
const WS_PUBLIC: &str = "wss://api.upbit.com/websocket/v1";
const WS_PRIVATE: &str = "wss://api.upbit.com/websocket/v1/private";
/// Published order-rate ceiling.
const ORDERS_PER_SEC: u32 = 8;

pub struct Upbit {
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

#[derive(Debug, Deserialize)]
struct UpbitError {
    error: UpbitErrorBody,
}

#[derive(Debug, Deserialize)]
struct UpbitErrorBody {
    name: String,
    message: String,
}

fn classify_upbit_error(status: u16, body: &str) -> ExchangeError {
    if let Ok(err) = serde_json::from_str::<UpbitError>(body) {
        let msg = format!("{}: {}", err.error.name, err.error.message);
        return match err.error.name.as_str() {
            "invalid_access_key" | "jwt_verification" | "expired_access_key" => {
                ExchangeError::AuthError(msg)
            }
            "too_many_requests" => ExchangeError::Throttled(msg),
            "order_not_found" => ExchangeError::NotFound(msg),
            "insufficient_funds_bid" | "insufficient_funds_ask" | "under_min_total_bid"
            | "under_min_total_ask" | "invalid_volume" | "invalid_price" => {
                ExchangeError::Rejected(msg)
            }
            _ => classify_http_error(status, &msg),
        };
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
    #[serde(default)]
    trades: Vec<RestTrade>,
}

#[derive(Debug, Deserialize)]
struct RestTrade {
    price: String,
    volume: String,
}

impl RestOrder {
    fn status(&self) -> OrderStatus {
        normalize_status(ExchangeId::Upbit, &self.state).unwrap_or(OrderStatus::Open)
    }

    fn filled(&self) -> Decimal {
        self.executed_volume.as_deref().map(dec).unwrap_or_default()
    }

    fn average_price(&self) -> Option<Decimal> {
        let mut qty = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for t in &self.trades {
            let v = dec(&t.volume);
            qty += v;
            notional += v * dec(&t.price);
        }
        if qty.is_zero() {
            None
        } else {
            Some(notional / qty)
        }
    }

    fn into_snapshot(self) -> OrderSnapshot {
        OrderSnapshot {
            status: self.status(),
            filled_qty: self.filled(),
            avg_price: self.average_price(),
            symbol: symbols::decode(ExchangeId::Upbit, &self.market),
            side: if self.side == "ask" { Side::Sell } else { Side::Buy },
            price: self.price.as_deref().map(dec).filter(|p| !p.is_zero()),
            qty: self.volume.as_deref().map(dec).unwrap_or_default(),
            exchange_order_id: self.uuid,
        }
    }
}

impl Upbit {
    pub fn new(ctx: AccountCtx, http: reqwest::Client, deadlines: Deadlines) -> Self {
        Self {
            ctx,
            http,
            deadlines,
            limiter: TokenBucket::new(20, 8.0),
            pacer: PacedLock::per_second(ORDERS_PER_SEC),
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
            return Err(classify_upbit_error(status, &body));
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
            return Err(classify_upbit_error(status, &body));
        }
        Ok(body)
    }

    /// Order placement params. Market buys must be stated as quote
    /// notional, which needs the sizing-time reference price.
    fn order_query(req: &OrderRequest) -> Result<String, ExchangeError> {
        let market = symbols::encode(ExchangeId::Upbit, &req.symbol);
        let side = venue_side(req.side);
        let mut params: Vec<(&str, String)> = match req.order_type {
            OrderType::Limit => {
                let price = req
                    .price
                    .ok_or_else(|| ExchangeError::Rejected("price required".into()))?;
                vec![
                    ("market", market),
                    ("side", side.to_string()),
                    ("volume", req.qty.normalize().to_string()),
                    ("price", price.normalize().to_string()),
                    ("ord_type", "limit".to_string()),
                ]
            }
            OrderType::Market => match req.side {
                Side::Buy => {
                    let ref_price = req.ref_price.ok_or_else(|| {
                        ExchangeError::Rejected("market buy needs a reference price".into())
                    })?;
                    let notional = (req.qty * ref_price).normalize();
                    vec![
                        ("market", market),
                        ("side", side.to_string()),
                        ("price", notional.to_string()),
                        ("ord_type", "price".to_string()),
                    ]
                }
                Side::Sell => vec![
                    ("market", market),
                    ("side", side.to_string()),
                    ("volume", req.qty.normalize().to_string()),
                    ("ord_type", "market".to_string()),
                ],
            },
            OrderType::StopMarket | OrderType::StopLimit => {
                return Err(ExchangeError::Rejected(
                    "upbit does not support stop orders".into(),
                ));
            }
            OrderType::CancelAllOrder => {
                return Err(ExchangeError::Rejected(
                    "CANCEL_ALL_ORDER is not a placement type".into(),
                ));
            }
        };
        if let Some(cid) = &req.client_order_id {
            params.push(("identifier", cid.clone()));
        }
        Ok(signing::query_string(&params))
    }
}

// === WS payload parsing ===

/// Ticker frames (delivered as binary JSON).
pub(crate) fn parse_ticker(text: &str) -> Vec<Quote> {
    #[derive(Deserialize)]
    struct Ticker {
        #[serde(rename = "type")]
        kind: String,
        code: String,
        trade_price: f64,
    }
    match serde_json::from_str::<Ticker>(text) {
        Ok(t) if t.kind == "ticker" => {
            let price = Decimal::from_f64_retain(t.trade_price).unwrap_or_default();
            vec![Quote {
                symbol: symbols::decode(ExchangeId::Upbit, &t.code),
                price,
            }]
        }
        _ => Vec::new(),
    }
}

/// `myOrder` frames from the private WS.
pub(crate) fn parse_my_order(text: &str) -> Vec<OrderFeedEvent> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    if v.get("type").and_then(|t| t.as_str()) != Some("myOrder") {
        return Vec::new();
    }
    let Some(raw_state) = v.get("state").and_then(|s| s.as_str()) else {
        return Vec::new();
    };
    let Some(status) = normalize_status(ExchangeId::Upbit, raw_state) else {
        return Vec::new();
    };
    let Some(uuid) = v.get("uuid").and_then(|u| u.as_str()) else {
        return Vec::new();
    };
    let Some(code) = v.get("code").and_then(|c| c.as_str()) else {
        return Vec::new();
    };
    let num = |key: &str| {
        v.get(key)
            .and_then(|x| x.as_f64())
            .and_then(Decimal::from_f64_retain)
    };
    // Partial executions arrive as state=trade frames with the order
    // still "wait"; cumulative executed_volume drives the fill delta.
    vec![OrderFeedEvent {
        exchange_order_id: uuid.to_string(),
        symbol: symbols::decode(ExchangeId::Upbit, code),
        status,
        filled_qty: num("executed_volume").unwrap_or_default(),
        last_fill_qty: num("trade_volume").unwrap_or_default(),
        last_fill_price: num("trade_price"),
        fee: num("trade_fee"),
        fill_seq: v
            .get("trade_timestamp")
            .and_then(|t| t.as_i64())
            .unwrap_or(0),
    }]
}

#[async_trait]
impl Exchange for Upbit {
    fn id(&self) -> ExchangeId {
        ExchangeId::Upbit
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_futures: false,
            supports_leverage: false,
            supports_batch: false,
            supports_private_ws: true,
            bulk_price_all: true,
            bulk_chunk: 0,
            orders_per_sec: ORDERS_PER_SEC,
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

    async fn fetch_price(&self, symbol: &str, _market: MarketType) -> Result<Quote, ExchangeError> {
        #[derive(Deserialize)]
        struct Ticker {
            market: String,
            trade_price: f64,
        }
        let query = format!("markets={}", symbols::encode(ExchangeId::Upbit, symbol));
        let body = retry_idempotent(3, || self.public_get("/v1/ticker", &query)).await?;
        let tickers: Vec<Ticker> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        let t = tickers
            .first()
            .ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {symbol}")))?;
        Ok(Quote {
            symbol: symbols::decode(ExchangeId::Upbit, &t.market),
            price: Decimal::from_f64_retain(t.trade_price).unwrap_or_default(),
        })
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
        // All-markets endpoint: one call regardless of symbol count.
        let body = retry_idempotent(3, || {
            self.public_get("/v1/ticker/all", "quote_currencies=KRW")
        })
        .await?;
        let tickers: Vec<Ticker> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        let mut quotes: Vec<Quote> = tickers
            .into_iter()
            .map(|t| Quote {
                symbol: symbols::decode(ExchangeId::Upbit, &t.market),
                price: Decimal::from_f64_retain(t.trade_price).unwrap_or_default(),
            })
            .collect();
        if let Some(filter) = symbols_filter {
            quotes.retain(|q| filter.contains(&q.symbol));
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
        Ok(OrderAck {
            status: order.status(),
            filled_qty: order.filled(),
            avg_price: order.average_price(),
            exchange_order_id: order.uuid,
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
            params.push(("market", symbols::encode(ExchangeId::Upbit, sym)));
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

    async fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let query = format!("identifier={client_order_id}");
        let result = retry_idempotent(3, || {
            self.private_request(reqwest::Method::GET, "/v1/order", &query, self.deadlines.slow)
        })
        .await;
        match result {
            Ok(body) => {
                let order: RestOrder = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
                Ok(Some(order.into_snapshot()))
            }
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_recent_fills(
        &self,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError> {
        // Fills are folded into order snapshots (trades[] on /v1/order);
        // the poller's snapshot path covers them.
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
            .filter(|m| m.market.starts_with("KRW-"))
            .map(|m| InstrumentMeta {
                symbol: symbols::decode(ExchangeId::Upbit, &m.market),
                // KRW ticks are price-banded and enforced venue-side.
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
            .map(|s| symbols::encode(ExchangeId::Upbit, s))
            .collect();
        let frame = json!([
            {"ticket": uuid::Uuid::new_v4().to_string()},
            {"type": "ticker", "codes": codes},
        ]);
        let session = WsSession {
            name: "upbit-public".to_string(),
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
        tx: mpsc::Sender<OrderFeedEvent>,
    ) {
        let frame = json!([
            {"ticket": uuid::Uuid::new_v4().to_string()},
            {"type": "myOrder"},
        ]);
        let session = WsSession {
            name: "upbit-private".to_string(),
            url: WS_PRIVATE.to_string(),
            headers: vec![("Authorization".to_string(), self.bearer(""))],
            subscribe_frames: vec![frame.to_string()],
            ping_interval: Duration::from_secs(60),
        };
        session.run(parse_my_order, tx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    fn market_req(side: Side, ref_price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/KRW".to_string(),
            side,
            order_type: OrderType::Market,
            qty: d!(0.5),
            price: None,
            stop_price: None,
            ref_price,
            client_order_id: None,
            market: MarketType::Spot,
            reduce_only: false,
        }
    }

    #[test]
    fn test_market_buy_is_quote_notional() {
        let query = Upbit::order_query(&market_req(Side::Buy, Some(d!(70000000)))).unwrap();
        assert!(query.contains("ord_type=price"));
        assert!(query.contains("price=35000000"));
        assert!(!query.contains("volume="));
    }

    #[test]
    fn test_market_buy_without_ref_price_rejected() {
        assert!(Upbit::order_query(&market_req(Side::Buy, None)).is_err());
    }

    #[test]
    fn test_market_sell_is_base_volume() {
        let query = Upbit::order_query(&market_req(Side::Sell, None)).unwrap();
        assert!(query.contains("ord_type=market"));
        assert!(query.contains("volume=0.5"));
    }

    #[test]
    fn test_stop_orders_rejected() {
        let mut req = market_req(Side::Buy, Some(d!(1)));
        req.order_type = OrderType::StopMarket;
        req.stop_price = Some(d!(1));
        assert!(matches!(
            Upbit::order_query(&req),
            Err(ExchangeError::Rejected(_))
        ));
    }

    #[test]
    fn test_parse_ticker() {
        let frame = r#"{"type":"ticker","code":"KRW-BTC","trade_price":70123000.0}"#;
        let quotes = parse_ticker(frame);
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].symbol, "BTC/KRW");
        assert_eq!(quotes[0].price, d!(70123000));

        assert!(parse_ticker(r#"{"status":"UP"}"#).is_empty());
    }

    #[test]
    fn test_parse_my_order() {
        let frame = r#"{"type":"myOrder","code":"KRW-BTC","uuid":"ac2dc2a3","state":"done","executed_volume":0.5,"trade_volume":0.1,"trade_price":70000000.0,"trade_fee":35.0,"trade_timestamp":1700000000123}"#;
        let events = parse_my_order(frame);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.status, OrderStatus::Filled);
        assert_eq!(ev.filled_qty, d!(0.5));
        assert_eq!(ev.last_fill_qty, d!(0.1));
        assert_eq!(ev.fill_seq, 1700000000123);
    }

    #[test]
    fn test_classify_upbit_errors() {
        let auth = r#"{"error":{"name":"invalid_access_key","message":"bad key"}}"#;
        assert!(matches!(
            classify_upbit_error(401, auth),
            ExchangeError::AuthError(_)
        ));
        let notional = r#"{"error":{"name":"under_min_total_bid","message":"too small"}}"#;
        assert!(matches!(
            classify_upbit_error(400, notional),
            ExchangeError::Rejected(_)
        ));
        let missing = r#"{"error":{"name":"order_not_found","message":"gone"}}"#;
        assert!(matches!(
            classify_upbit_error(404, missing),
            ExchangeError::NotFound(_)
        ));
    }

    #[test]
    fn test_rest_order_avg_price_from_trades() {
        let order = RestOrder {
            uuid: "u1".to_string(),
            side: "bid".to_string(),
            state: "done".to_string(),
            market: "KRW-BTC".to_string(),
            price: None,
            volume: Some("0.2".to_string()),
            executed_volume: Some("0.2".to_string()),
            trades: vec![
                RestTrade {
                    price: "70000000".to_string(),
                    volume: "0.1".to_string(),
                },
                RestTrade {
                    price: "70002000".to_string(),
                    volume: "0.1".to_string(),
                },
            ],
        };
        assert_eq!(order.average_price(), Some(d!(70001000)));
        let snap = order.into_snapshot();
        assert_eq!(snap.symbol, "BTC/KRW");
        assert_eq!(snap.status, OrderStatus::Filled);
    }
}
