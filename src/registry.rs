//! Precision & symbol registry.
//!
//! Holds per-venue instrument metadata (tick size, step size, minimums)
//! loaded at boot and refreshed periodically. Read-mostly: many readers
//! on the dispatch path, one writer on refresh.

use std::sync::RwLock;

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::core_types::{ExchangeId, Side};
use crate::error::RouterError;
use crate::symbols;

/// Per-instrument trading rules as reported by the venue.
#[derive(Debug, Clone)]
pub struct InstrumentMeta {
    /// Canonical symbol (`BASE/QUOTE` for crypto).
    pub symbol: String,
    /// Price increment.
    pub tick_size: Decimal,
    /// Quantity increment.
    pub step_size: Decimal,
    pub min_qty: Decimal,
    /// Minimum order notional in quote currency.
    pub min_notional: Decimal,
    pub supports_futures: bool,
    pub supports_perpetual: bool,
    /// Venue-reported leverage ceiling; 1 for spot-only instruments.
    pub max_leverage: u32,
}

/// Registry of instrument metadata keyed by (venue, canonical symbol).
#[derive(Default)]
pub struct SymbolRegistry {
    instruments: RwLock<FxHashMap<(ExchangeId, String), InstrumentMeta>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all metadata for one venue (boot load and periodic refresh).
    pub fn upsert_all(&self, exchange: ExchangeId, metas: Vec<InstrumentMeta>) {
        let mut map = self.instruments.write().expect("registry lock poisoned");
        map.retain(|(ex, _), _| *ex != exchange);
        for meta in metas {
            map.insert((exchange, meta.symbol.clone()), meta);
        }
    }

    pub fn get(&self, exchange: ExchangeId, symbol: &str) -> Option<InstrumentMeta> {
        self.instruments
            .read()
            .expect("registry lock poisoned")
            .get(&(exchange, symbol.to_string()))
            .cloned()
    }

    pub fn instrument_count(&self, exchange: ExchangeId) -> usize {
        self.instruments
            .read()
            .expect("registry lock poisoned")
            .keys()
            .filter(|(ex, _)| *ex == exchange)
            .count()
    }

    /// Round a price to the instrument tick. Buy prices floor, sell
    /// prices ceil, so the rounded order never crosses tighter than the
    /// caller intended.
    pub fn round_price(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        side: Side,
        price: Decimal,
    ) -> Option<Decimal> {
        let meta = self.get(exchange, symbol)?;
        if meta.tick_size.is_zero() {
            return Some(price);
        }
        let ticks = price / meta.tick_size;
        let rounded = match side {
            Side::Buy => ticks.floor(),
            Side::Sell => ticks.ceil(),
        };
        Some((rounded * meta.tick_size).normalize())
    }

    /// Floor a quantity to the instrument step.
    pub fn round_qty(&self, exchange: ExchangeId, symbol: &str, qty: Decimal) -> Option<Decimal> {
        let meta = self.get(exchange, symbol)?;
        if meta.step_size.is_zero() {
            return Some(qty);
        }
        Some(((qty / meta.step_size).floor() * meta.step_size).normalize())
    }

    /// Validate an already-rounded order against venue minimums.
    /// `price` is the limit/stop price when present, else the reference
    /// price used for the notional check.
    pub fn validate_order(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        qty: Decimal,
        price: Option<Decimal>,
    ) -> Result<(), RouterError> {
        let meta = self
            .get(exchange, symbol)
            .ok_or_else(|| RouterError::InvalidSymbol(format!("{exchange}:{symbol}")))?;

        if qty <= Decimal::ZERO {
            return Err(RouterError::Precision("quantity rounded to zero".into()));
        }
        if qty < meta.min_qty {
            return Err(RouterError::Precision(format!(
                "quantity {} below minimum {}",
                qty, meta.min_qty
            )));
        }
        if let Some(px) = price {
            if px <= Decimal::ZERO {
                return Err(RouterError::Precision("price must be positive".into()));
            }
            if !meta.tick_size.is_zero() && px < meta.tick_size {
                return Err(RouterError::Precision(format!(
                    "price {} below tick {}",
                    px, meta.tick_size
                )));
            }
            if px * qty < meta.min_notional {
                return Err(RouterError::MinNotional);
            }
        }
        Ok(())
    }

    /// Authoritative symbol check: syntax plus, for crypto, registry
    /// membership on the given venue.
    pub fn symbol_ok(&self, exchange: ExchangeId, raw: &str) -> bool {
        if !symbols::symbol_ok(raw) {
            return false;
        }
        if raw.contains('/') {
            self.get(exchange, raw).is_some()
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_meta() -> InstrumentMeta {
        InstrumentMeta {
            symbol: "BTC/USDT".to_string(),
            tick_size: dec!(0.1),
            step_size: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(10),
            supports_futures: true,
            supports_perpetual: true,
            max_leverage: 125,
        }
    }

    fn registry() -> SymbolRegistry {
        let reg = SymbolRegistry::new();
        reg.upsert_all(ExchangeId::Binance, vec![btc_meta()]);
        reg
    }

    #[test]
    fn test_round_price_by_side() {
        let reg = registry();
        let buy = reg
            .round_price(ExchangeId::Binance, "BTC/USDT", Side::Buy, dec!(50000.17))
            .unwrap();
        assert_eq!(buy, dec!(50000.1));
        let sell = reg
            .round_price(ExchangeId::Binance, "BTC/USDT", Side::Sell, dec!(50000.17))
            .unwrap();
        assert_eq!(sell, dec!(50000.2));
    }

    #[test]
    fn test_round_qty_floors_to_step() {
        let reg = registry();
        let qty = reg
            .round_qty(ExchangeId::Binance, "BTC/USDT", dec!(0.00237))
            .unwrap();
        assert_eq!(qty, dec!(0.0023));
    }

    #[test]
    fn test_validate_order_min_notional() {
        let reg = registry();
        let err = reg
            .validate_order(
                ExchangeId::Binance,
                "BTC/USDT",
                dec!(0.0001),
                Some(dec!(50000)),
            )
            .unwrap_err();
        // 0.0001 * 50000 = 5 < 10
        assert!(matches!(err, RouterError::MinNotional));

        reg.validate_order(
            ExchangeId::Binance,
            "BTC/USDT",
            dec!(0.001),
            Some(dec!(50000)),
        )
        .unwrap();
    }

    #[test]
    fn test_validate_order_rejects_zero_and_subtick() {
        let reg = registry();
        assert!(
            reg.validate_order(ExchangeId::Binance, "BTC/USDT", Decimal::ZERO, None)
                .is_err()
        );
        let err = reg
            .validate_order(
                ExchangeId::Binance,
                "BTC/USDT",
                dec!(1),
                Some(dec!(0.01)),
            )
            .unwrap_err();
        assert!(matches!(err, RouterError::Precision(_)));
    }

    #[test]
    fn test_unknown_symbol() {
        let reg = registry();
        assert!(reg.get(ExchangeId::Binance, "DOGE/USDT").is_none());
        assert!(!reg.symbol_ok(ExchangeId::Binance, "DOGE/USDT"));
        assert!(reg.symbol_ok(ExchangeId::Binance, "BTC/USDT"));
        // securities bypass registry membership
        assert!(reg.symbol_ok(ExchangeId::Binance, "AAPL"));
    }

    #[test]
    fn test_refresh_replaces_venue_entries() {
        let reg = registry();
        assert_eq!(reg.instrument_count(ExchangeId::Binance), 1);
        let mut eth = btc_meta();
        eth.symbol = "ETH/USDT".to_string();
        reg.upsert_all(ExchangeId::Binance, vec![eth]);
        assert_eq!(reg.instrument_count(ExchangeId::Binance), 1);
        assert!(reg.get(ExchangeId::Binance, "BTC/USDT").is_none());
        assert!(reg.get(ExchangeId::Binance, "ETH/USDT").is_some());
    }
}
