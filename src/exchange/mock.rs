//! Deterministic mock exchange for tests and `USE_MOCK_EXCHANGE` runs.
//!
//! Orders get sequential `MOCK-<n>` ids. MARKET orders fill instantly at
//! the configured price; LIMIT/STOP orders rest as NEW until a test
//! advances them via `emit` or `complete_order`. Failures are injected
//! with `fail_next`, and every placement is recorded for assertions.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};

use crate::core_types::{ExchangeId, MarketType, OrderStatus, OrderType, Side};
use crate::error::ExchangeError;
use crate::registry::InstrumentMeta;
use rust_decimal_macros::dec;

use super::{
    BalanceSnapshot, Capabilities, Exchange, OrderAck, OrderFeedEvent, OrderRequest,
    OrderSnapshot, Quote,
};

#[derive(Default)]
struct MockState {
    next_id: u64,
    orders: HashMap<String, OrderSnapshot>,
    placed: Vec<OrderRequest>,
    cancelled: Vec<String>,
    fail_queue: VecDeque<ExchangeError>,
    prices: HashMap<String, Decimal>,
    balance: BalanceSnapshot,
    leverage: HashMap<String, u32>,
    client_ids: HashMap<String, String>,
}

pub struct MockExchange {
    state: Mutex<MockState>,
    feed_tx: broadcast::Sender<OrderFeedEvent>,
    /// Optional artificial latency per order call, for pacing tests.
    pub call_delay: Duration,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(256);
        let mut state = MockState::default();
        state.balance = BalanceSnapshot {
            free: dec!(10000),
            used: Decimal::ZERO,
            total: dec!(10000),
        };
        state.prices.insert("BTC/USDT".to_string(), dec!(50000));
        state.prices.insert("ETH/USDT".to_string(), dec!(3000));
        Self {
            state: Mutex::new(state),
            feed_tx,
            call_delay: Duration::ZERO,
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, free: Decimal, used: Decimal) {
        self.state.lock().unwrap().balance = BalanceSnapshot {
            free,
            used,
            total: free + used,
        };
    }

    /// Next `create_order` call fails with `err`.
    pub fn fail_next(&self, err: ExchangeError) {
        self.state.lock().unwrap().fail_queue.push_back(err);
    }

    /// All placements seen so far.
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn leverage_for(&self, symbol: &str) -> Option<u32> {
        self.state.lock().unwrap().leverage.get(symbol).copied()
    }

    /// Push a private-feed event, as the venue would over WS.
    pub fn emit(&self, event: OrderFeedEvent) {
        if let Some(order) = self
            .state
            .lock()
            .unwrap()
            .orders
            .get_mut(&event.exchange_order_id)
        {
            if order.status.can_transition_to(event.status) {
                order.status = event.status;
            }
            if event.filled_qty > order.filled_qty {
                order.filled_qty = event.filled_qty;
            }
        }
        let _ = self.feed_tx.send(event);
    }

    /// Convenience: fully fill a resting order and emit the event.
    pub fn complete_order(&self, exchange_order_id: &str) {
        let snapshot = self
            .state
            .lock()
            .unwrap()
            .orders
            .get(exchange_order_id)
            .cloned();
        if let Some(order) = snapshot {
            self.emit(OrderFeedEvent {
                exchange_order_id: exchange_order_id.to_string(),
                symbol: order.symbol.clone(),
                status: OrderStatus::Filled,
                filled_qty: order.qty,
                last_fill_qty: order.qty - order.filled_qty,
                last_fill_price: order.price.or(order.avg_price),
                fee: None,
                fill_seq: 1,
            });
        }
    }

    fn price_of(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .unwrap_or(dec!(100))
    }
}

#[async_trait]
impl Exchange for MockExchange {
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
            orders_per_sec: 100,
        }
    }

    async fn fetch_balance(&self, _market: MarketType) -> Result<BalanceSnapshot, ExchangeError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn fetch_price(&self, symbol: &str, _market: MarketType) -> Result<Quote, ExchangeError> {
        Ok(Quote {
            symbol: symbol.to_string(),
            price: self.price_of(symbol),
        })
    }

    async fn fetch_prices_bulk(
        &self,
        symbols: Option<&[String]>,
        _market: MarketType,
    ) -> Result<Vec<Quote>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prices
            .iter()
            .filter(|(sym, _)| symbols.map(|f| f.contains(sym)).unwrap_or(true))
            .map(|(sym, price)| Quote {
                symbol: sym.clone(),
                price: *price,
            })
            .collect())
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_queue.pop_front() {
            state.placed.push(req.clone());
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("MOCK-{}", state.next_id);
        let price = req.ref_price.unwrap_or_else(|| {
            state
                .prices
                .get(&req.symbol)
                .copied()
                .unwrap_or(dec!(100))
        });

        let (status, filled, avg) = match req.order_type {
            OrderType::Market => (OrderStatus::Filled, req.qty, Some(price)),
            _ => (OrderStatus::New, Decimal::ZERO, None),
        };
        state.orders.insert(
            id.clone(),
            OrderSnapshot {
                exchange_order_id: id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                status,
                price: req.price,
                qty: req.qty,
                filled_qty: filled,
                avg_price: avg,
            },
        );
        if let Some(cid) = &req.client_order_id {
            state.client_ids.insert(cid.clone(), id.clone());
        }
        state.placed.push(req.clone());
        Ok(OrderAck {
            exchange_order_id: id,
            status,
            filled_qty: filled,
            avg_price: avg,
        })
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get_mut(exchange_order_id) else {
            return Err(ExchangeError::NotFound(exchange_order_id.to_string()));
        };
        if order.status.is_terminal() {
            return Err(ExchangeError::Conflict(format!(
                "order {exchange_order_id} already {}",
                order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        state.cancelled.push(exchange_order_id.to_string());
        Ok(())
    }

    async fn cancel_all(
        &self,
        symbol: &str,
        side: Option<Side>,
        _market: MarketType,
    ) -> Result<Vec<String>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = state
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && !o.status.is_terminal()
                    && side.map(|s| o.side == s).unwrap_or(true)
            })
            .map(|o| o.exchange_order_id.clone())
            .collect();
        for id in &ids {
            if let Some(order) = state.orders.get_mut(id) {
                order.status = OrderStatus::Cancelled;
            }
            state.cancelled.push(id.clone());
        }
        Ok(ids)
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
        _market: MarketType,
    ) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<OrderSnapshot, ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))
    }

    async fn fetch_order_by_client_id(
        &self,
        client_order_id: &str,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .client_ids
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn fetch_recent_fills(
        &self,
        _symbol: &str,
        _market: MarketType,
    ) -> Result<Vec<OrderFeedEvent>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.state
            .lock()
            .unwrap()
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn fetch_instruments(
        &self,
        market: MarketType,
    ) -> Result<Vec<InstrumentMeta>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prices
            .keys()
            .map(|sym| InstrumentMeta {
                symbol: sym.clone(),
                tick_size: dec!(0.1),
                step_size: dec!(0.0001),
                min_qty: dec!(0.0001),
                min_notional: dec!(10),
                supports_futures: market == MarketType::Futures,
                supports_perpetual: market == MarketType::Futures,
                max_leverage: 125,
            })
            .collect())
    }

    async fn ws_subscribe_public_prices(
        &self,
        symbols: Vec<String>,
        _market: MarketType,
        tx: mpsc::Sender<Quote>,
    ) {
        // One snapshot per symbol, then idle; tests drive further updates
        // through set_price + fetch paths.
        for sym in symbols {
            let quote = Quote {
                price: self.price_of(&sym),
                symbol: sym,
            };
            if tx.send(quote).await.is_err() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    async fn ws_subscribe_private_orders(
        &self,
        _market: MarketType,
        tx: mpsc::Sender<OrderFeedEvent>,
    ) {
        let mut rx = self.feed_tx.subscribe();
        while let Ok(event) = rx.recv().await {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_order(symbol: &str, side: Side, qty: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_price: None,
            ref_price: None,
            client_order_id: None,
            market: MarketType::Spot,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let mock = MockExchange::new();
        let ack = mock
            .create_order(&market_order("BTC/USDT", Side::Buy, dec!(0.002)))
            .await
            .unwrap();
        assert_eq!(ack.exchange_order_id, "MOCK-1");
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_qty, dec!(0.002));
        assert_eq!(ack.avg_price, Some(dec!(50000)));
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_completed() {
        let mock = MockExchange::new();
        let mut req = market_order("BTC/USDT", Side::Buy, dec!(0.01));
        req.order_type = OrderType::Limit;
        req.price = Some(dec!(49000));
        let ack = mock.create_order(&req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);

        mock.complete_order(&ack.exchange_order_id);
        let snap = mock
            .fetch_order(&ack.exchange_order_id, "BTC/USDT", MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(snap.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_fail_next_injects_error() {
        let mock = MockExchange::new();
        mock.fail_next(ExchangeError::Throttled("busy".into()));
        let err = mock
            .create_order(&market_order("BTC/USDT", Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Throttled(_)));
        // next call succeeds
        assert!(
            mock.create_order(&market_order("BTC/USDT", Side::Buy, dec!(1)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_cancel_all_by_side() {
        let mock = MockExchange::new();
        let mut buy1 = market_order("BTC/USDT", Side::Buy, dec!(1));
        buy1.order_type = OrderType::Limit;
        buy1.price = Some(dec!(49000));
        let mut buy2 = buy1.clone();
        buy2.price = Some(dec!(48000));
        let mut sell1 = buy1.clone();
        sell1.side = Side::Sell;
        sell1.price = Some(dec!(51000));

        mock.create_order(&buy1).await.unwrap();
        mock.create_order(&buy2).await.unwrap();
        let sell_ack = mock.create_order(&sell1).await.unwrap();

        let cancelled = mock
            .cancel_all("BTC/USDT", Some(Side::Buy), MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 2);
        let open = mock
            .fetch_open_orders(Some("BTC/USDT"), MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].exchange_order_id, sell_ack.exchange_order_id);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_conflict() {
        let mock = MockExchange::new();
        let ack = mock
            .create_order(&market_order("BTC/USDT", Side::Buy, dec!(1)))
            .await
            .unwrap();
        let err = mock
            .cancel_order(&ack.exchange_order_id, "BTC/USDT", MarketType::Spot)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Conflict(_)));
    }
}
