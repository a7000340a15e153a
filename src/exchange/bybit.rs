//! Bybit adapter (v5 unified: spot + linear perpetuals).
//!
//! Requests are header-signed (HMAC-SHA256 over timestamp+key+window+
//! payload). Bybit ships a native batch endpoint, so `create_batch_orders`
//! is overridden instead of serialized.

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
    AccountCtx, BalanceSnapshot, BatchResult, Capabilities, Deadlines, Exchange, OrderAck,
    OrderFeedEvent, OrderRequest, OrderSnapshot, Quote, normalize_status, retry_idempotent,
};

const REST: &str = "https://api.bybit.com";
const REST_TESTNET: &str = "https://api-testnet.bybit.com";
const WS_PUBLIC: &str = "wss://stream.bybit.com/v5/public";
const WS_PRIVATE: &str = "wss://stream.bybit.com/v5/private";
const RECV_WINDOW: u32 = 5_000;
/// Native batch endpoint accepts at most 10 orders per call.
const BATCH_CHUNK: usize = 10;

pub struct Bybit {
    ctx: AccountCtx,
    http: reqwest::Client,
    deadlines: Deadlines,
    limiter: TokenBucket,
    pacer: PacedLock,
}

fn category(market: MarketType) -> &'static str {
    match market {
        MarketType::Spot => "spot",
        MarketType::Futures => "linear",
    }
}

fn venue_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

fn classify_ret_code(code: i64, msg: &str) -> ExchangeError {
    match code {
        10003 | 10004 | 10005 | 33004 => ExchangeError::AuthError(msg.to_string()),
        10006 | 10018 => ExchangeError::Throttled(msg.to_string()),
        110001 | 170213 => ExchangeError::NotFound(msg.to_string()),
        110010 | 170143 => ExchangeError::Conflict(msg.to_string()),
        110003 | 110004 | 110007 | 110012 | 170131 | 170136 => {
            ExchangeError::Rejected(msg.to_string())
        }
        _ => ExchangeError::UnknownTerminal(format!("retCode {code}: {msg}")),
    }
}

impl Bybit {
    pub fn new(ctx: AccountCtx, http: reqwest::Client, deadlines: Deadlines) -> Self {
        Self {
            ctx,
            http,
            deadlines,
            limiter: TokenBucket::new(40, 10.0),
            pacer: PacedLock::per_second(10),
        }
    }

    fn rest_base(&self) -> &'static str {
        if self.ctx.testnet { REST_TESTNET } else { REST }
    }

    async fn signed_get(
        &self,
        path: &str,
        query: &str,
        deadline: Duration,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire().await;
        let ts = signing::timestamp_ms();
        let sign = signing::bybit_sign(&self.ctx.secret_key, ts, &self.ctx.public_key, RECV_WINDOW, query);
        let url = if query.is_empty() {
            format!("{}{}", self.rest_base(), path)
        } else {
            format!("{}{}?{}", self.rest_base(), path, query)
        };
        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.ctx.public_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sign)
            .timeout(deadline)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        Self::unwrap_envelope(resp).await
    }

    async fn signed_post(
        &self,
        path: &str,
        body: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire().await;
        let ts = signing::timestamp_ms();
        let raw = body.to_string();
        let sign = signing::bybit_sign(&self.ctx.secret_key, ts, &self.ctx.public_key, RECV_WINDOW, &raw);
        let url = format!("{}{}", self.rest_base(), path);
        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.ctx.public_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sign)
            .header("Content-Type", "application/json")
            .body(raw)
            .timeout(deadline)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        Self::unwrap_envelope(resp).await
    }

    async fn public_get(
        &self,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire().await;
        let url = format!("{}{}?{}", self.rest_base(), path, query);
        let resp = self
            .http
            .get(&url)
            .timeout(self.deadlines.slow)
            .send()
            .await
            .map_err(ExchangeError::from)?;
        Self::unwrap_envelope(resp).await
    }

    async fn unwrap_envelope(resp: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if status == 429 {
            return Err(ExchangeError::Throttled(body));
        }
        let envelope: Envelope = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::UnknownTerminal(format!("bad envelope: {e}")))?;
        if envelope.ret_code != 0 {
            return Err(classify_ret_code(envelope.ret_code, &envelope.ret_msg));
        }
        Ok(envelope.result)
    }

    fn order_body(req: &OrderRequest) -> Result<serde_json::Value, ExchangeError> {
        let order_type = match req.order_type {
            OrderType::Market | OrderType::StopMarket => "Market",
            OrderType::Limit | OrderType::StopLimit => "Limit",
            OrderType::CancelAllOrder => {
                return Err(ExchangeError::Rejected(
                    "CANCEL_ALL_ORDER is not a placement type".into(),
                ));
            }
        };
        let mut body = json!({
            "category": category(req.market),
            "symbol": symbols::encode(ExchangeId::Bybit, &req.symbol),
            "side": venue_side(req.side),
            "orderType": order_type,
            "qty": req.qty.normalize().to_string(),
        });
        if matches!(req.order_type, OrderType::Limit | OrderType::StopLimit) {
            let price = req
                .price
                .ok_or_else(|| ExchangeError::Rejected("price required".into()))?;
            body["price"] = json!(price.normalize().to_string());
            body["timeInForce"] = json!("GTC");
        }
        if matches!(req.order_type, OrderType::StopMarket | OrderType::StopLimit) {
            let stop = req
                .stop_price
                .ok_or_else(|| ExchangeError::Rejected("stop_price required".into()))?;
            body["triggerPrice"] = json!(stop.normalize().to_string());
        }
        if req.reduce_only && req.market == MarketType::Futures {
            body["reduceOnly"] = json!(true);
        }
        if let Some(cid) = &req.client_order_id {
            body["orderLinkId"] = json!(cid);
        }
        Ok(body)
    }

    fn snapshot_from_value(v: &serde_json::Value) -> Option<OrderSnapshot> {
        let raw_status = v.get("orderStatus")?.as_str()?;
        Some(OrderSnapshot {
            exchange_order_id: v.get("orderId")?.as_str()?.to_string(),
            symbol: symbols::decode(ExchangeId::Bybit, v.get("symbol")?.as_str()?),
            side: match v.get("side").and_then(|s| s.as_str()) {
                Some("Sell") => Side::Sell,
                _ => Side::Buy,
            },
            status: normalize_status(ExchangeId::Bybit, raw_status)?,
            price: v
                .get("price")
                .and_then(|p| p.as_str())
                .map(dec)
                .filter(|p| !p.is_zero()),
            qty: v.get("qty").and_then(|q| q.as_str()).map(dec).unwrap_or_default(),
            filled_qty: v
                .get("cumExecQty")
                .and_then(|q| q.as_str())
                .map(dec)
                .unwrap_or_default(),
            avg_price: v
                .get("avgPrice")
                .and_then(|p| p.as_str())
                .map(dec)
                .filter(|p| !p.is_zero()),
        })
    }
}

// === WS payload parsing ===

/// `publicTrade.<SYMBOL>` tick frames.
pub(crate) fn parse_public_trade(text: &str) -> Vec<Quote> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let is_trade = v
        .get("topic")
        .and_then(|t| t.as_str())
        .map(|t| t.starts_with("publicTrade."))
        .unwrap_or(false);
    if !is_trade {
        return Vec::new();
    }
    let Some(data) = v.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|t| {
            Some(Quote {
                symbol: symbols::decode(ExchangeId::Bybit, t.get("s")?.as_str()?),
                price: dec(t.get("p")?.as_str()?),
            })
        })
        .collect()
}

/// Private `order` topic frames.
pub(crate) fn parse_private_order(text: &str) -> Vec<OrderFeedEvent> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    if v.get("topic").and_then(|t| t.as_str()) != Some("order") {
        return Vec::new();
    }
    let Some(data) = v.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    let seq = v.get("seq").and_then(|s| s.as_i64()).unwrap_or(0);
    data.iter()
        .filter_map(|o| {
            let status = normalize_status(ExchangeId::Bybit, o.get("orderStatus")?.as_str()?)?;
            Some(OrderFeedEvent {
                exchange_order_id: o.get("orderId")?.as_str()?.to_string(),
                symbol: symbols::decode(ExchangeId::Bybit, o.get("symbol")?.as_str()?),
                status,
                filled_qty: o
                    .get("cumExecQty")
                    .and_then(|q| q.as_str())
                    .map(dec)
                    .unwrap_or_default(),
                last_fill_qty: Decimal::ZERO,
                last_fill_price: o
                    .get("avgPrice")
                    .and_then(|p| p.as_str())
                    .map(dec)
                    .filter(|p| !p.is_zero()),
                fee: None,
                fill_seq: seq,
            })
        })
        .collect()
}

#[async_trait]
impl Exchange for Bybit {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_futures: true,
            supports_leverage: true,
            supports_batch: true,
            supports_private_ws: true,
            bulk_price_all: true,
            bulk_chunk: 100,
            orders_per_sec: 10,
        }
    }

    async fn fetch_balance(&self, market: MarketType) -> Result<BalanceSnapshot, ExchangeError> {
        let _ = market; // unified account holds one USDT wallet
        let result = retry_idempotent(3, || {
            self.signed_get(
                "/v5/account/wallet-balance",
                "accountType=UNIFIED",
                self.deadlines.slow,
            )
        })
        .await?;
        let coin = result
            .get("list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .and_then(|acct| acct.get("coin"))
            .and_then(|c| c.as_array())
            .and_then(|coins| {
                coins
                    .iter()
                    .find(|c| c.get("coin").and_then(|n| n.as_str()) == Some("USDT"))
            })
            .cloned()
            .unwrap_or_default();
        let total = coin
            .get("walletBalance")
            .and_then(|b| b.as_str())
            .map(dec)
            .unwrap_or_default();
        let locked = coin
            .get("locked")
            .and_then(|b| b.as_str())
            .map(dec)
            .unwrap_or_default();
        Ok(BalanceSnapshot {
            free: total - locked,
            used: locked,
            total,
        })
    }

    async fn fetch_price(&self, symbol: &str, market: MarketType) -> Result<Quote, ExchangeError> {
        let query = format!(
            "category={}&symbol={}",
            category(market),
            symbols::encode(ExchangeId::Bybit, symbol)
        );
        let result = retry_idempotent(3, || self.public_get("/v5/market/tickers", &query)).await?;
        let ticker = result
            .get("list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {symbol}")))?;
        Ok(Quote {
            symbol: symbols::decode(
                ExchangeId::Bybit,
                ticker.get("symbol").and_then(|s| s.as_str()).unwrap_or(""),
            ),
            price: ticker
                .get("lastPrice")
                .and_then(|p| p.as_str())
                .map(dec)
                .unwrap_or_default(),
        })
    }

    async fn fetch_prices_bulk(
        &self,
        symbols_filter: Option<&[String]>,
        market: MarketType,
    ) -> Result<Vec<Quote>, ExchangeError> {
        let query = format!("category={}", category(market));
        let result = retry_idempotent(3, || self.public_get("/v5/market/tickers", &query)).await?;
        let mut quotes: Vec<Quote> = result
            .get("list")
            .and_then(|l| l.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|t| {
                        Some(Quote {
                            symbol: symbols::decode(ExchangeId::Bybit, t.get("symbol")?.as_str()?),
                            price: dec(t.get("lastPrice")?.as_str()?),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(filter) = symbols_filter {
            quotes.retain(|q| filter.contains(&q.symbol));
        }
        Ok(quotes)
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let body = Self::order_body(req)?;
        let deadline = if req.order_type.is_fast_path() {
            self.deadlines.fast
        } else {
            self.deadlines.slow
        };
        let _pace = self.pacer.acquire().await;
        let result = self.signed_post("/v5/order/create", body, deadline).await?;
        let order_id = result
            .get("orderId")
            .and_then(|id| id.as_str())
            .ok_or_else(|| ExchangeError::UnknownTerminal("create returned no orderId".into()))?
            .to_string();

        // v5 create acks with ids only; market orders are settled enough
        // to snapshot immediately for the fast path.
        if req.order_type == OrderType::Market {
            if let Ok(snap) = self.fetch_order(&order_id, &req.symbol, req.market).await {
                return Ok(OrderAck {
                    exchange_order_id: snap.exchange_order_id,
                    status: snap.status,
                    filled_qty: snap.filled_qty,
                    avg_price: snap.avg_price,
                });
            }
        }
        Ok(OrderAck {
            exchange_order_id: order_id,
            status: OrderStatus::New,
            filled_qty: Decimal::ZERO,
            avg_price: None,
        })
    }

    async fn create_batch_orders(&self, reqs: &[OrderRequest]) -> BatchResult {
        let mut results = Vec::with_capacity(reqs.len());
        for chunk in reqs.chunks(BATCH_CHUNK) {
            let bodies: Result<Vec<_>, ExchangeError> =
                chunk.iter().map(Self::order_body).collect();
            let bodies = match bodies {
                Ok(b) => b,
                Err(e) => {
                    results.extend(chunk.iter().map(|_| Err(e.clone())));
                    continue;
                }
            };
            let market = chunk[0].market;
            let payload = json!({
                "category": category(market),
                "request": bodies,
            });
            let _pace = self.pacer.acquire().await;
            match self
                .signed_post("/v5/order/create-batch", payload, self.deadlines.slow)
                .await
            {
                Ok(result) => {
                    let acks = result
                        .get("list")
                        .and_then(|l| l.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for (i, _req) in chunk.iter().enumerate() {
                        let ack = acks.get(i).and_then(|a| {
                            Some(OrderAck {
                                exchange_order_id: a.get("orderId")?.as_str()?.to_string(),
                                status: OrderStatus::New,
                                filled_qty: Decimal::ZERO,
                                avg_price: None,
                            })
                        });
                        results.push(ack.ok_or_else(|| {
                            ExchangeError::UnknownTerminal("missing batch ack entry".into())
                        }));
                    }
                }
                Err(e) => {
                    results.extend(chunk.iter().map(|_| Err(e.clone())));
                }
            }
        }
        BatchResult { results }
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": category(market),
            "symbol": symbols::encode(ExchangeId::Bybit, symbol),
            "orderId": exchange_order_id,
        });
        retry_idempotent(3, || {
            self.signed_post("/v5/order/cancel", body.clone(), self.deadlines.fast)
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
        match side {
            None => {
                let body = json!({
                    "category": category(market),
                    "symbol": symbols::encode(ExchangeId::Bybit, symbol),
                });
                let result = self
                    .signed_post("/v5/order/cancel-all", body, self.deadlines.fast)
                    .await?;
                Ok(result
                    .get("list")
                    .and_then(|l| l.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|o| Some(o.get("orderId")?.as_str()?.to_string()))
                            .collect()
                    })
                    .unwrap_or_default())
            }
            Some(side) => {
                // Side-filtered cancel has no native form: list and cancel.
                let open = self.fetch_open_orders(Some(symbol), market).await?;
                let mut cancelled = Vec::new();
                for order in open.into_iter().filter(|o| o.side == side) {
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
        }
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        market: MarketType,
    ) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let mut query = format!("category={}", category(market));
        if let Some(sym) = symbol {
            query.push_str(&format!(
                "&symbol={}",
                symbols::encode(ExchangeId::Bybit, sym)
            ));
        }
        let result = retry_idempotent(3, || {
            self.signed_get("/v5/order/realtime", &query, self.deadlines.slow)
        })
        .await?;
        Ok(result
            .get("list")
            .and_then(|l| l.as_array())
            .map(|list| list.iter().filter_map(Self::snapshot_from_value).collect())
            .unwrap_or_default())
    }

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let query = format!(
            "category={}&symbol={}&orderId={}",
            category(market),
            symbols::encode(ExchangeId::Bybit, symbol),
            exchange_order_id
        );
        // Realtime only covers open orders; settled ones move to history.
        for path in ["/v5/order/realtime", "/v5/order/history"] {
            let result = retry_idempotent(3, || self.signed_get(path, &query, self.deadlines.slow))
                .await?;
            if let Some(snap) = result
                .get("list")
                .and_then(|l| l.as_array())
                .and_then(|l| l.first())
                .and_then(Self::snapshot_from_value)
            {
                return Ok(snap);
            }
        }
        Err(ExchangeError::NotFound(format!(
            "order {exchange_order_id} not found"
        )))
    }

    async fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let query = format!(
            "category={}&symbol={}&orderLinkId={}",
            category(market),
            symbols::encode(ExchangeId::Bybit, symbol),
            client_order_id
        );
        for path in ["/v5/order/realtime", "/v5/order/history"] {
            let result = retry_idempotent(3, || self.signed_get(path, &query, self.deadlines.slow))
                .await?;
            if let Some(snap) = result
                .get("list")
                .and_then(|l| l.as_array())
                .and_then(|l| l.first())
                .and_then(Self::snapshot_from_value)
            {
                return Ok(Some(snap));
            }
        }
        Ok(None)
    }

    async fn fetch_recent_fills(
        &self,
        symbol: &str,
        market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError> {
        let query = format!(
            "category={}&symbol={}&limit=50",
            category(market),
            symbols::encode(ExchangeId::Bybit, symbol)
        );
        let result = retry_idempotent(3, || {
            self.signed_get("/v5/execution/list", &query, self.deadlines.slow)
        })
        .await?;
        Ok(result
            .get("list")
            .and_then(|l| l.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|e| {
                        Some(OrderFeedEvent {
                            exchange_order_id: e.get("orderId")?.as_str()?.to_string(),
                            symbol: symbols::decode(ExchangeId::Bybit, e.get("symbol")?.as_str()?),
                            status: OrderStatus::PartiallyFilled,
                            filled_qty: Decimal::ZERO,
                            last_fill_qty: dec(e.get("execQty")?.as_str()?),
                            last_fill_price: Some(dec(e.get("execPrice")?.as_str()?)),
                            fee: e.get("execFee").and_then(|f| f.as_str()).map(dec),
                            fill_seq: e.get("seq").and_then(|s| s.as_i64()).unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = json!({
            "category": "linear",
            "symbol": symbols::encode(ExchangeId::Bybit, symbol),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self
            .signed_post("/v5/position/set-leverage", body, self.deadlines.slow)
            .await
        {
            Ok(_) => Ok(()),
            // 110043: leverage already set to the requested value
            Err(ExchangeError::UnknownTerminal(msg)) if msg.contains("110043") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_instruments(
        &self,
        market: MarketType,
    ) -> Result<Vec<InstrumentMeta>, ExchangeError> {
        let query = format!("category={}&limit=1000", category(market));
        let result =
            retry_idempotent(3, || self.public_get("/v5/market/instruments-info", &query)).await?;
        Ok(result
            .get("list")
            .and_then(|l| l.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|i| {
                        let lot = i.get("lotSizeFilter")?;
                        Some(InstrumentMeta {
                            symbol: symbols::decode(ExchangeId::Bybit, i.get("symbol")?.as_str()?),
                            tick_size: i
                                .get("priceFilter")
                                .and_then(|p| p.get("tickSize"))
                                .and_then(|t| t.as_str())
                                .map(dec)
                                .unwrap_or_default(),
                            step_size: lot
                                .get("qtyStep")
                                .or_else(|| lot.get("basePrecision"))
                                .and_then(|s| s.as_str())
                                .map(dec)
                                .unwrap_or_default(),
                            min_qty: lot
                                .get("minOrderQty")
                                .and_then(|q| q.as_str())
                                .map(dec)
                                .unwrap_or_default(),
                            min_notional: lot
                                .get("minNotionalValue")
                                .or_else(|| lot.get("minOrderAmt"))
                                .and_then(|n| n.as_str())
                                .map(dec)
                                .unwrap_or_default(),
                            supports_futures: market == MarketType::Futures,
                            supports_perpetual: i.get("contractType").and_then(|c| c.as_str())
                                == Some("LinearPerpetual"),
                            max_leverage: i
                                .get("leverageFilter")
                                .and_then(|l| l.get("maxLeverage"))
                                .and_then(|m| m.as_str())
                                .and_then(|m| m.parse::<f64>().ok())
                                .map(|m| m as u32)
                                .unwrap_or(1),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ws_subscribe_public_prices(
        &self,
        syms: Vec<String>,
        market: MarketType,
        tx: mpsc::Sender<Quote>,
    ) {
        let args: Vec<String> = syms
            .iter()
            .map(|s| format!("publicTrade.{}", symbols::encode(ExchangeId::Bybit, s)))
            .collect();
        let session = WsSession {
            name: format!("bybit-{}-public", category(market)),
            url: format!("{}/{}", WS_PUBLIC, category(market)),
            headers: Vec::new(),
            subscribe_frames: vec![json!({"op": "subscribe", "args": args}).to_string()],
            ping_interval: Duration::from_secs(20),
        };
        session.run(parse_public_trade, tx).await;
    }

    async fn ws_subscribe_private_orders(
        &self,
        _market: MarketType,
        tx: mpsc::Sender<OrderFeedEvent>,
    ) {
        // Private auth: HMAC over "GET/realtime{expires}".
        let expires = signing::timestamp_ms() + 60_000;
        let sign = signing::hmac_sha256_hex(
            &self.ctx.secret_key,
            &format!("GET/realtime{expires}"),
        );
        let session = WsSession {
            name: "bybit-private".to_string(),
            url: WS_PRIVATE.to_string(),
            headers: Vec::new(),
            subscribe_frames: vec![
                json!({"op": "auth", "args": [self.ctx.public_key, expires, sign]}).to_string(),
                json!({"op": "subscribe", "args": ["order"]}).to_string(),
            ],
            ping_interval: Duration::from_secs(20),
        };
        session.run(parse_private_order, tx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    #[test]
    fn test_parse_public_trade() {
        let frame = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","data":[{"s":"BTCUSDT","p":"50100.5","v":"0.01"},{"s":"BTCUSDT","p":"50101.0","v":"0.02"}]}"#;
        let quotes = parse_public_trade(frame);
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].symbol, "BTC/USDT");
        assert_eq!(quotes[1].price, d!(50101.0));

        assert!(parse_public_trade(r#"{"op":"pong"}"#).is_empty());
    }

    #[test]
    fn test_parse_private_order() {
        let frame = r#"{"topic":"order","seq":314,"data":[{"orderId":"abc-123","symbol":"ETHUSDT","orderStatus":"PartiallyFilled","cumExecQty":"0.5","avgPrice":"3000.0","side":"Buy"}]}"#;
        let events = parse_private_order(frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].exchange_order_id, "abc-123");
        assert_eq!(events[0].status, OrderStatus::PartiallyFilled);
        assert_eq!(events[0].filled_qty, d!(0.5));
        assert_eq!(events[0].fill_seq, 314);
    }

    #[test]
    fn test_parse_private_order_skips_unknown_status() {
        let frame = r#"{"topic":"order","data":[{"orderId":"x","symbol":"ETHUSDT","orderStatus":"Mystery"}]}"#;
        assert!(parse_private_order(frame).is_empty());
    }

    #[test]
    fn test_classify_ret_codes() {
        assert!(matches!(
            classify_ret_code(10006, "rate"),
            ExchangeError::Throttled(_)
        ));
        assert!(matches!(
            classify_ret_code(10003, "key"),
            ExchangeError::AuthError(_)
        ));
        assert!(matches!(
            classify_ret_code(110001, "no order"),
            ExchangeError::NotFound(_)
        ));
        assert!(matches!(
            classify_ret_code(110007, "balance"),
            ExchangeError::Rejected(_)
        ));
    }

    #[test]
    fn test_order_body_stop_limit() {
        let req = OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopLimit,
            qty: d!(0.01),
            price: Some(d!(49000)),
            stop_price: Some(d!(49500)),
            ref_price: None,
            client_order_id: None,
            market: MarketType::Futures,
            reduce_only: false,
        };
        let body = Bybit::order_body(&req).unwrap();
        assert_eq!(body["category"], "linear");
        assert_eq!(body["symbol"], "BTCUSDT");
        assert_eq!(body["orderType"], "Limit");
        assert_eq!(body["price"], "49000");
        assert_eq!(body["triggerPrice"], "49500");
    }
}
