//! Binance adapter (spot + USDⓈ-M futures).
//!
//! REST is signed with HMAC-SHA256 over the query string; the private
//! order feed runs over a listen-key user-data stream that must be kept
//! alive with a REST PUT every 30 minutes.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

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

const SPOT_REST: &str = "https://api.binance.com";
const SPOT_REST_TESTNET: &str = "https://testnet.binance.vision";
const FUTURES_REST: &str = "https://fapi.binance.com";
const FUTURES_REST_TESTNET: &str = "https://testnet.binancefuture.com";
const SPOT_WS: &str = "wss://stream.binance.com:9443";
const FUTURES_WS: &str = "wss://fstream.binance.com";
const RECV_WINDOW: u32 = 5_000;

pub struct Binance {
    ctx: AccountCtx,
    http: reqwest::Client,
    deadlines: Deadlines,
    limiter: TokenBucket,
    pacer: PacedLock,
}

impl Binance {
    pub fn new(ctx: AccountCtx, http: reqwest::Client, deadlines: Deadlines) -> Self {
        Self {
            ctx,
            http,
            deadlines,
            // 1200 request-weight/min published ceiling, kept conservative
            limiter: TokenBucket::new(50, 15.0),
            pacer: PacedLock::per_second(10),
        }
    }

    fn rest_base(&self, market: MarketType) -> &'static str {
        match (market, self.ctx.testnet) {
            (MarketType::Spot, false) => SPOT_REST,
            (MarketType::Spot, true) => SPOT_REST_TESTNET,
            (MarketType::Futures, false) => FUTURES_REST,
            (MarketType::Futures, true) => FUTURES_REST_TESTNET,
        }
    }

    fn api_prefix(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "/api/v3",
            MarketType::Futures => "/fapi/v1",
        }
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        market: MarketType,
        path: &str,
        mut params: Vec<(&str, String)>,
        deadline: Duration,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire().await;

        params.push(("timestamp", signing::timestamp_ms().to_string()));
        params.push(("recvWindow", RECV_WINDOW.to_string()));
        let query = signing::query_string(&params);
        let signature = signing::hmac_sha256_hex(&self.ctx.secret_key, &query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.rest_base(market),
            path,
            query,
            signature
        );

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.ctx.public_key)
            .timeout(deadline)
            .send()
            .await
            .map_err(ExchangeError::from)?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !(200..300).contains(&status) {
            return Err(classify_binance_error(status, &body));
        }
        Ok(body)
    }

    async fn public_get(
        &self,
        market: MarketType,
        path: &str,
        query: Option<String>,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire().await;
        let url = match query {
            Some(q) => format!("{}{}?{}", self.rest_base(market), path, q),
            None => format!("{}{}", self.rest_base(market), path),
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
            return Err(classify_binance_error(status, &body));
        }
        Ok(body)
    }

    fn order_params(req: &OrderRequest) -> Result<Vec<(&'static str, String)>, ExchangeError> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, &req.symbol)),
            ("side", venue_side(req.side).to_string()),
        ];
        let venue_type = match (req.market, req.order_type) {
            (_, OrderType::Market) => "MARKET",
            (_, OrderType::Limit) => "LIMIT",
            (MarketType::Futures, OrderType::StopMarket) => "STOP_MARKET",
            (MarketType::Futures, OrderType::StopLimit) => "STOP",
            (MarketType::Spot, OrderType::StopMarket) => "STOP_LOSS",
            (MarketType::Spot, OrderType::StopLimit) => "STOP_LOSS_LIMIT",
            (_, OrderType::CancelAllOrder) => {
                return Err(ExchangeError::Rejected(
                    "CANCEL_ALL_ORDER is not a placement type".into(),
                ));
            }
        };
        params.push(("type", venue_type.to_string()));
        params.push(("quantity", req.qty.normalize().to_string()));
        if matches!(req.order_type, OrderType::Limit | OrderType::StopLimit) {
            let price = req.price.ok_or_else(|| {
                ExchangeError::Rejected("price required for limit order".into())
            })?;
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if matches!(req.order_type, OrderType::StopMarket | OrderType::StopLimit) {
            let stop = req.stop_price.ok_or_else(|| {
                ExchangeError::Rejected("stop_price required for stop order".into())
            })?;
            params.push(("stopPrice", stop.normalize().to_string()));
        }
        if req.reduce_only && req.market == MarketType::Futures {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(cid) = &req.client_order_id {
            params.push(("newClientOrderId", cid.clone()));
        }
        Ok(params)
    }
}

fn venue_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn classify_binance_error(status: u16, body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ErrBody {
        code: Option<i64>,
        msg: Option<String>,
    }
    if let Ok(err) = serde_json::from_str::<ErrBody>(body) {
        let msg = err.msg.unwrap_or_else(|| body.to_string());
        match err.code {
            Some(-1003) | Some(-1015) => return ExchangeError::Throttled(msg),
            Some(-2010) | Some(-1013) | Some(-1111) => return ExchangeError::Rejected(msg),
            Some(-2011) => return ExchangeError::Conflict(msg),
            Some(-2013) => return ExchangeError::NotFound(msg),
            Some(-2014) | Some(-2015) | Some(-1022) => return ExchangeError::AuthError(msg),
            _ => {}
        }
    }
    classify_http_error(status, body)
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

// === REST response payloads ===

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotBalanceEntry {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotAccount {
    balances: Vec<SpotBalanceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalanceEntry {
    asset: String,
    balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestOrder {
    symbol: String,
    order_id: i64,
    status: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    orig_qty: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    side: Option<String>,
}

impl RestOrder {
    fn status(&self) -> OrderStatus {
        normalize_status(ExchangeId::Binance, &self.status).unwrap_or(OrderStatus::New)
    }

    fn filled(&self) -> Decimal {
        self.executed_qty.as_deref().map(dec).unwrap_or_default()
    }

    fn average_price(&self) -> Option<Decimal> {
        // Futures reports avgPrice; spot derives it from the quote volume.
        if let Some(avg) = self.avg_price.as_deref() {
            let avg = dec(avg);
            if !avg.is_zero() {
                return Some(avg);
            }
        }
        let filled = self.filled();
        if filled.is_zero() {
            return None;
        }
        self.cummulative_quote_qty
            .as_deref()
            .map(dec)
            .filter(|q| !q.is_zero())
            .map(|quote| quote / filled)
    }

    fn into_snapshot(self) -> OrderSnapshot {
        OrderSnapshot {
            status: self.status(),
            filled_qty: self.filled(),
            avg_price: self.average_price(),
            exchange_order_id: self.order_id.to_string(),
            symbol: symbols::decode(ExchangeId::Binance, &self.symbol),
            side: match self.side.as_deref() {
                Some("SELL") => Side::Sell,
                _ => Side::Buy,
            },
            price: self.price.as_deref().map(dec).filter(|p| !p.is_zero()),
            qty: self.orig_qty.as_deref().map(dec).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyTrade {
    id: i64,
    order_id: i64,
    symbol: String,
    price: String,
    qty: String,
    #[serde(default)]
    commission: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoSymbol {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_type: Option<String>,
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ListenKey {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

// === WS payload parsing (pure, unit-tested) ===

/// Combined-stream trade tick: `{"stream":"btcusdt@trade","data":{...}}`.
pub(crate) fn parse_public_trade(text: &str) -> Vec<Quote> {
    #[derive(Deserialize)]
    struct Tick {
        s: String,
        p: String,
    }
    #[derive(Deserialize)]
    struct Frame {
        data: Tick,
    }
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => vec![Quote {
            symbol: symbols::decode(ExchangeId::Binance, &frame.data.s),
            price: dec(&frame.data.p),
        }],
        Err(_) => Vec::new(),
    }
}

/// Spot `executionReport` or futures `ORDER_TRADE_UPDATE` events.
pub(crate) fn parse_private_event(text: &str) -> Vec<OrderFeedEvent> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let payload = match value.get("e").and_then(|e| e.as_str()) {
        Some("executionReport") => &value,
        Some("ORDER_TRADE_UPDATE") => match value.get("o") {
            Some(inner) => inner,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let get_str = |key: &str| payload.get(key).and_then(|v| v.as_str());
    let Some(raw_status) = get_str("X") else {
        return Vec::new();
    };
    let Some(status) = normalize_status(ExchangeId::Binance, raw_status) else {
        return Vec::new();
    };
    let Some(order_id) = payload.get("i").and_then(|v| v.as_i64()) else {
        return Vec::new();
    };
    let symbol = get_str("s").map(|s| symbols::decode(ExchangeId::Binance, s));
    let Some(symbol) = symbol else {
        return Vec::new();
    };

    let last_qty = get_str("l").map(dec).unwrap_or_default();
    let last_price = get_str("L").map(dec).filter(|p| !p.is_zero());
    let cum_qty = get_str("z").map(dec).unwrap_or_default();
    let fee = get_str("n").map(dec).filter(|f| !f.is_zero());
    let trade_id = payload.get("t").and_then(|v| v.as_i64()).unwrap_or(0);

    vec![OrderFeedEvent {
        exchange_order_id: order_id.to_string(),
        symbol,
        status,
        filled_qty: cum_qty,
        last_fill_qty: last_qty,
        last_fill_price: last_price,
        fee,
        fill_seq: trade_id.max(0),
    }]
}

fn parse_instrument(sym: &ExchangeInfoSymbol, market: MarketType) -> Option<InstrumentMeta> {
    if let Some(status) = &sym.status {
        if status != "TRADING" {
            return None;
        }
    }
    let mut tick = Decimal::ZERO;
    let mut step = Decimal::ZERO;
    let mut min_qty = Decimal::ZERO;
    let mut min_notional = Decimal::ZERO;
    for filter in &sym.filters {
        match filter.get("filterType").and_then(|t| t.as_str()) {
            Some("PRICE_FILTER") => {
                tick = filter
                    .get("tickSize")
                    .and_then(|v| v.as_str())
                    .map(dec)
                    .unwrap_or_default();
            }
            Some("LOT_SIZE") => {
                step = filter
                    .get("stepSize")
                    .and_then(|v| v.as_str())
                    .map(dec)
                    .unwrap_or_default();
                min_qty = filter
                    .get("minQty")
                    .and_then(|v| v.as_str())
                    .map(dec)
                    .unwrap_or_default();
            }
            Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                min_notional = filter
                    .get("minNotional")
                    .or_else(|| filter.get("notional"))
                    .and_then(|v| v.as_str())
                    .map(dec)
                    .unwrap_or_default();
            }
            _ => {}
        }
    }
    Some(InstrumentMeta {
        symbol: symbols::decode(ExchangeId::Binance, &sym.symbol),
        tick_size: tick,
        step_size: step,
        min_qty,
        min_notional,
        supports_futures: market == MarketType::Futures,
        supports_perpetual: sym.contract_type.as_deref() == Some("PERPETUAL"),
        max_leverage: if market == MarketType::Futures { 125 } else { 1 },
    })
}

#[async_trait]
impl Exchange for Binance {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_futures: true,
            supports_leverage: true,
            supports_batch: false,
            supports_private_ws: true,
            bulk_price_all: true,
            bulk_chunk: 100,
            orders_per_sec: 10,
        }
    }

    async fn fetch_balance(&self, market: MarketType) -> Result<BalanceSnapshot, ExchangeError> {
        match market {
            MarketType::Spot => {
                let body = retry_idempotent(3, || {
                    self.signed_request(
                        reqwest::Method::GET,
                        market,
                        "/api/v3/account",
                        vec![],
                        self.deadlines.slow,
                    )
                })
                .await?;
                let account: SpotAccount = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
                let usdt = account
                    .balances
                    .iter()
                    .find(|b| b.asset == "USDT")
                    .map(|b| (dec(&b.free), dec(&b.locked)))
                    .unwrap_or_default();
                Ok(BalanceSnapshot {
                    free: usdt.0,
                    used: usdt.1,
                    total: usdt.0 + usdt.1,
                })
            }
            MarketType::Futures => {
                let body = retry_idempotent(3, || {
                    self.signed_request(
                        reqwest::Method::GET,
                        market,
                        "/fapi/v2/balance",
                        vec![],
                        self.deadlines.slow,
                    )
                })
                .await?;
                let entries: Vec<FuturesBalanceEntry> = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
                let usdt = entries.iter().find(|b| b.asset == "USDT");
                let total = usdt.map(|b| dec(&b.balance)).unwrap_or_default();
                let free = usdt.map(|b| dec(&b.available_balance)).unwrap_or_default();
                Ok(BalanceSnapshot {
                    free,
                    used: total - free,
                    total,
                })
            }
        }
    }

    async fn fetch_price(&self, symbol: &str, market: MarketType) -> Result<Quote, ExchangeError> {
        let native = symbols::encode(ExchangeId::Binance, symbol);
        let path = format!("{}/ticker/price", Self::api_prefix(market));
        let body = retry_idempotent(3, || {
            self.public_get(market, &path, Some(format!("symbol={native}")))
        })
        .await?;
        let ticker: TickerPrice = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(Quote {
            symbol: symbols::decode(ExchangeId::Binance, &ticker.symbol),
            price: dec(&ticker.price),
        })
    }

    async fn fetch_prices_bulk(
        &self,
        symbols_filter: Option<&[String]>,
        market: MarketType,
    ) -> Result<Vec<Quote>, ExchangeError> {
        // The all-markets endpoint is a single call; filtering happens
        // locally, which keeps us clear of URL length limits entirely.
        let path = format!("{}/ticker/price", Self::api_prefix(market));
        let body = retry_idempotent(3, || self.public_get(market, &path, None))
            .await?;
        let tickers: Vec<TickerPrice> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        let mut quotes: Vec<Quote> = tickers
            .into_iter()
            .map(|t| Quote {
                symbol: symbols::decode(ExchangeId::Binance, &t.symbol),
                price: dec(&t.price),
            })
            .collect();
        if let Some(filter) = symbols_filter {
            quotes.retain(|q| filter.contains(&q.symbol));
        }
        Ok(quotes)
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let params = Self::order_params(req)?;
        let path = format!("{}/order", Self::api_prefix(req.market));
        let deadline = if req.order_type.is_fast_path() {
            self.deadlines.fast
        } else {
            self.deadlines.slow
        };

        let _pace = self.pacer.acquire().await;
        let body = self
            .signed_request(reqwest::Method::POST, req.market, &path, params, deadline)
            .await?;
        let order: RestOrder = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(OrderAck {
            exchange_order_id: order.order_id.to_string(),
            status: order.status(),
            filled_qty: order.filled(),
            avg_price: order.average_price(),
        })
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, symbol)),
            ("orderId", exchange_order_id.to_string()),
        ];
        let path = format!("{}/order", Self::api_prefix(market));
        retry_idempotent(3, || {
            self.signed_request(
                reqwest::Method::DELETE,
                market,
                &path,
                params.clone(),
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
        // Side-filtered cancel has no native endpoint: list then cancel
        // each under the pacing lock.
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
                Err(ExchangeError::NotFound(_)) | Err(ExchangeError::Conflict(_)) => {
                    // Already gone; the feed will settle its final state.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        market: MarketType,
    ) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(sym) = symbol {
            params.push(("symbol", symbols::encode(ExchangeId::Binance, sym)));
        }
        let body = retry_idempotent(3, || {
            self.signed_request(
                reqwest::Method::GET,
                market,
                &format!("{}/openOrders", Self::api_prefix(market)),
                params.clone(),
                self.deadlines.slow,
            )
        })
        .await?;
        let orders: Vec<RestOrder> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(orders.into_iter().map(RestOrder::into_snapshot).collect())
    }

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, symbol)),
            ("orderId", exchange_order_id.to_string()),
        ];
        let body = retry_idempotent(3, || {
            self.signed_request(
                reqwest::Method::GET,
                market,
                &format!("{}/order", Self::api_prefix(market)),
                params.clone(),
                self.deadlines.slow,
            )
        })
        .await?;
        let order: RestOrder = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(order.into_snapshot())
    }

    async fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let params = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, symbol)),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let result = retry_idempotent(3, || {
            self.signed_request(
                reqwest::Method::GET,
                market,
                &format!("{}/order", Self::api_prefix(market)),
                params.clone(),
                self.deadlines.slow,
            )
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
        symbol: &str,
        market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError> {
        let path = match market {
            MarketType::Spot => "/api/v3/myTrades",
            MarketType::Futures => "/fapi/v1/userTrades",
        };
        let params = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, symbol)),
            ("limit", "50".to_string()),
        ];
        let body = retry_idempotent(3, || {
            self.signed_request(
                reqwest::Method::GET,
                market,
                path,
                params.clone(),
                self.deadlines.slow,
            )
        })
        .await?;
        let trades: Vec<MyTrade> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(trades
            .into_iter()
            .map(|t| OrderFeedEvent {
                exchange_order_id: t.order_id.to_string(),
                symbol: symbols::decode(ExchangeId::Binance, &t.symbol),
                // Fills do not carry order state; status settles via the
                // order snapshot path, forward-only.
                status: OrderStatus::PartiallyFilled,
                filled_qty: Decimal::ZERO,
                last_fill_qty: dec(&t.qty),
                last_fill_price: Some(dec(&t.price)),
                fee: t.commission.as_deref().map(dec),
                fill_seq: t.id,
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbols::encode(ExchangeId::Binance, symbol)),
            ("leverage", leverage.to_string()),
        ];
        self.signed_request(
            reqwest::Method::POST,
            MarketType::Futures,
            "/fapi/v1/leverage",
            params,
            self.deadlines.slow,
        )
        .await?;
        Ok(())
    }

    async fn fetch_instruments(
        &self,
        market: MarketType,
    ) -> Result<Vec<InstrumentMeta>, ExchangeError> {
        let body = retry_idempotent(3, || {
            self.public_get(
                market,
                &format!("{}/exchangeInfo", Self::api_prefix(market)),
                None,
            )
        })
        .await?;
        let info: ExchangeInfo = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(info
            .symbols
            .iter()
            .filter_map(|s| parse_instrument(s, market))
            .collect())
    }

    async fn ws_subscribe_public_prices(
        &self,
        syms: Vec<String>,
        market: MarketType,
        tx: mpsc::Sender<Quote>,
    ) {
        let streams: Vec<String> = syms
            .iter()
            .map(|s| {
                format!(
                    "{}@trade",
                    symbols::encode(ExchangeId::Binance, s).to_lowercase()
                )
            })
            .collect();
        let ws_base = match market {
            MarketType::Spot => SPOT_WS,
            MarketType::Futures => FUTURES_WS,
        };
        let session = WsSession {
            name: format!("binance-{}-public", market.as_str().to_lowercase()),
            url: format!("{}/stream?streams={}", ws_base, streams.join("/")),
            headers: Vec::new(),
            subscribe_frames: Vec::new(),
            ping_interval: Duration::from_secs(180),
        };
        session.run(parse_public_trade, tx).await;
    }

    async fn ws_subscribe_private_orders(
        &self,
        market: MarketType,
        tx: mpsc::Sender<OrderFeedEvent>,
    ) {
        loop {
            if tx.is_closed() {
                return;
            }
            // A listen key is valid for 60 minutes and must be extended
            // with a keepalive PUT every 30.
            let listen_path = match market {
                MarketType::Spot => "/api/v3/userDataStream",
                MarketType::Futures => "/fapi/v1/listenKey",
            };
            let key = match self.user_stream_key(market, listen_path).await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "binance listen key request failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            let ws_base = match market {
                MarketType::Spot => SPOT_WS,
                MarketType::Futures => FUTURES_WS,
            };
            let session = WsSession {
                name: format!("binance-{}-private", market.as_str().to_lowercase()),
                url: format!("{}/ws/{}", ws_base, key),
                headers: Vec::new(),
            subscribe_frames: Vec::new(),
                ping_interval: Duration::from_secs(180),
            };

            let keepalive = self.keepalive_loop(market, listen_path);
            tokio::select! {
                _ = session.run(parse_private_event, tx.clone()) => return,
                _ = keepalive => {
                    // keepalive failed: rotate the listen key
                }
            }
        }
    }
}

impl Binance {
    async fn user_stream_key(
        &self,
        market: MarketType,
        path: &str,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.rest_base(market), path);
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.ctx.public_key)
            .timeout(self.deadlines.slow)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !(200..300).contains(&status) {
            return Err(classify_binance_error(status, &body));
        }
        let key: ListenKey = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(e.to_string()))?;
        Ok(key.listen_key)
    }

    async fn keepalive_loop(&self, market: MarketType, path: &str) {
        let mut tick = tokio::time::interval(Duration::from_secs(30 * 60));
        tick.tick().await;
        loop {
            tick.tick().await;
            let url = format!("{}{}", self.rest_base(market), path);
            let result = self
                .http
                .put(&url)
                .header("X-MBX-APIKEY", &self.ctx.public_key)
                .timeout(self.deadlines.slow)
                .send()
                .await;
            if let Err(e) = result {
                warn!(error = %e, "binance listen key keepalive failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    #[test]
    fn test_parse_public_trade() {
        let frame = r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","p":"50123.40","q":"0.002"}}"#;
        let quotes = parse_public_trade(frame);
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].symbol, "BTC/USDT");
        assert_eq!(quotes[0].price, d!(50123.40));

        assert!(parse_public_trade("not json").is_empty());
        assert!(parse_public_trade(r#"{"result":null,"id":1}"#).is_empty());
    }

    #[test]
    fn test_parse_execution_report() {
        let frame = r#"{"e":"executionReport","s":"BTCUSDT","i":12345,"X":"PARTIALLY_FILLED","l":"0.001","L":"50000.0","z":"0.001","n":"0.05","t":777}"#;
        let events = parse_private_event(frame);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.exchange_order_id, "12345");
        assert_eq!(ev.symbol, "BTC/USDT");
        assert_eq!(ev.status, OrderStatus::PartiallyFilled);
        assert_eq!(ev.last_fill_qty, d!(0.001));
        assert_eq!(ev.filled_qty, d!(0.001));
        assert_eq!(ev.last_fill_price, Some(d!(50000.0)));
        assert_eq!(ev.fill_seq, 777);
    }

    #[test]
    fn test_parse_futures_order_update() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","o":{"s":"ETHUSDT","i":99,"X":"FILLED","l":"1.5","L":"3000","z":"1.5","n":"0.6","t":42}}"#;
        let events = parse_private_event(frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OrderStatus::Filled);
        assert_eq!(events[0].symbol, "ETH/USDT");
        assert_eq!(events[0].fill_seq, 42);
    }

    #[test]
    fn test_parse_private_ignores_other_events() {
        assert!(parse_private_event(r#"{"e":"outboundAccountPosition"}"#).is_empty());
        assert!(parse_private_event(r#"{"e":"executionReport","s":"BTCUSDT","i":1,"X":"WEIRD"}"#).is_empty());
    }

    #[test]
    fn test_order_params_limit() {
        let req = OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: d!(0.002),
            price: Some(d!(50000)),
            stop_price: None,
            ref_price: None,
            client_order_id: None,
            market: MarketType::Spot,
            reduce_only: false,
        };
        let params = Binance::order_params(&req).unwrap();
        let find = |k: &str| params.iter().find(|(pk, _)| *pk == k).map(|(_, v)| v.clone());
        assert_eq!(find("symbol").unwrap(), "BTCUSDT");
        assert_eq!(find("side").unwrap(), "BUY");
        assert_eq!(find("type").unwrap(), "LIMIT");
        assert_eq!(find("quantity").unwrap(), "0.002");
        assert_eq!(find("price").unwrap(), "50000");
        assert_eq!(find("timeInForce").unwrap(), "GTC");
    }

    #[test]
    fn test_order_params_stop_requires_stop_price() {
        let req = OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopMarket,
            qty: d!(0.01),
            price: None,
            stop_price: None,
            ref_price: None,
            client_order_id: None,
            market: MarketType::Futures,
            reduce_only: true,
        };
        assert!(Binance::order_params(&req).is_err());
    }

    #[test]
    fn test_classify_binance_error_codes() {
        assert!(matches!(
            classify_binance_error(400, r#"{"code":-1003,"msg":"Too many requests"}"#),
            ExchangeError::Throttled(_)
        ));
        assert!(matches!(
            classify_binance_error(400, r#"{"code":-2010,"msg":"insufficient balance"}"#),
            ExchangeError::Rejected(_)
        ));
        assert!(matches!(
            classify_binance_error(400, r#"{"code":-2013,"msg":"Order does not exist"}"#),
            ExchangeError::NotFound(_)
        ));
        assert!(matches!(
            classify_binance_error(401, r#"{"code":-2014,"msg":"API-key invalid"}"#),
            ExchangeError::AuthError(_)
        ));
    }

    #[test]
    fn test_rest_order_avg_price_spot_derivation() {
        let order = RestOrder {
            symbol: "BTCUSDT".to_string(),
            order_id: 1,
            status: "FILLED".to_string(),
            price: Some("0".to_string()),
            orig_qty: Some("0.002".to_string()),
            executed_qty: Some("0.002".to_string()),
            avg_price: None,
            cummulative_quote_qty: Some("100.0".to_string()),
            side: Some("BUY".to_string()),
        };
        assert_eq!(order.average_price(), Some(d!(50000)));
    }
}
