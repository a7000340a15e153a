//! Last-trade price cache.
//!
//! Process-wide map of (venue, market, symbol) to the most recent trade
//! price. Entries expire after `ttl`; sizing additionally rejects entries
//! older than `stale_after` and falls back to a synchronous REST fetch.
//! Writers are the public WS feeds and on-demand REST fetches.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::core_types::{ExchangeId, MarketType};

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub price: Decimal,
    pub updated_at: Instant,
}

pub struct PriceCache {
    entries: DashMap<(ExchangeId, MarketType, String), PricePoint>,
    ttl: Duration,
    stale_after: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration, stale_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stale_after,
        }
    }

    /// Record a fresh trade price (WS tick or REST quote).
    pub fn insert(&self, exchange: ExchangeId, market: MarketType, symbol: &str, price: Decimal) {
        self.entries.insert(
            (exchange, market, symbol.to_string()),
            PricePoint {
                price,
                updated_at: Instant::now(),
            },
        );
    }

    /// Entry within TTL, if any.
    pub fn get(&self, exchange: ExchangeId, market: MarketType, symbol: &str) -> Option<Decimal> {
        self.get_within(exchange, market, symbol, self.ttl)
    }

    /// Entry usable for sizing: within the (longer) staleness bound.
    pub fn get_for_sizing(
        &self,
        exchange: ExchangeId,
        market: MarketType,
        symbol: &str,
    ) -> Option<Decimal> {
        self.get_within(exchange, market, symbol, self.stale_after)
    }

    fn get_within(
        &self,
        exchange: ExchangeId,
        market: MarketType,
        symbol: &str,
        max_age: Duration,
    ) -> Option<Decimal> {
        let key = (exchange, market, symbol.to_string());
        let point = *self.entries.get(&key)?;
        if point.updated_at.elapsed() > max_age {
            self.entries
                .remove_if(&key, |_, v| v.updated_at.elapsed() > max_age);
            return None;
        }
        Some(point.price)
    }

    /// Age of the cached entry, if present (expired or not).
    pub fn age(
        &self,
        exchange: ExchangeId,
        market: MarketType,
        symbol: &str,
    ) -> Option<Duration> {
        self.entries
            .get(&(exchange, market, symbol.to_string()))
            .map(|e| e.updated_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cache(ttl_ms: u64, stale_ms: u64) -> PriceCache {
        PriceCache::new(
            Duration::from_millis(ttl_ms),
            Duration::from_millis(stale_ms),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let c = cache(30_000, 60_000);
        c.insert(ExchangeId::Binance, MarketType::Spot, "BTC/USDT", dec!(50000));
        assert_eq!(
            c.get(ExchangeId::Binance, MarketType::Spot, "BTC/USDT"),
            Some(dec!(50000))
        );
        // market segment is part of the key
        assert_eq!(
            c.get(ExchangeId::Binance, MarketType::Futures, "BTC/USDT"),
            None
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(0, 60_000);
        c.insert(ExchangeId::Upbit, MarketType::Spot, "BTC/KRW", dec!(70000000));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.get(ExchangeId::Upbit, MarketType::Spot, "BTC/KRW"), None);
    }

    #[test]
    fn test_sizing_window_outlives_ttl() {
        let c = cache(0, 60_000);
        c.insert(ExchangeId::Binance, MarketType::Spot, "ETH/USDT", dec!(3000));
        std::thread::sleep(Duration::from_millis(5));
        // expired for display, still acceptable for sizing
        assert_eq!(
            c.get_for_sizing(ExchangeId::Binance, MarketType::Spot, "ETH/USDT"),
            Some(dec!(3000))
        );
    }

    #[test]
    fn test_overwrite_refreshes() {
        let c = cache(30_000, 60_000);
        c.insert(ExchangeId::Bybit, MarketType::Futures, "BTC/USDT", dec!(1));
        c.insert(ExchangeId::Bybit, MarketType::Futures, "BTC/USDT", dec!(2));
        assert_eq!(
            c.get(ExchangeId::Bybit, MarketType::Futures, "BTC/USDT"),
            Some(dec!(2))
        );
        assert_eq!(c.len(), 1);
    }
}
