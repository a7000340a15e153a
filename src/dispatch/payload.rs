//! Webhook payload parsing and batch expansion.
//!
//! The wire format is either a single order (fields at the top level) or
//! a batch (`orders: [...]`, with the top-level `symbol` inherited by
//! sub-orders that omit it). Expansion validates per-type required
//! fields and sorts the batch by dispatch priority:
//! MARKET > CANCEL_ALL_ORDER > LIMIT > STOP_MARKET ~ STOP_LIMIT.

use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::core_types::{OrderType, Side};
use crate::error::RouterError;
use crate::symbols;

/// Raw webhook body, single or batch.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RawWebhook {
    pub group_name: String,
    pub token: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub qty_per: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    /// Optional client idempotency key; duplicates get 409.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub orders: Option<Vec<RawSubOrder>>,
}

/// One sub-order inside a batch payload.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RawSubOrder {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    pub order_type: OrderType,
    #[serde(default)]
    pub qty_per: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
}

/// A validated sub-order, ready for sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct SubOrder {
    pub symbol: String,
    /// None only for CANCEL_ALL_ORDER without a side filter.
    pub side: Option<Side>,
    pub order_type: OrderType,
    /// Zero for CANCEL_ALL_ORDER.
    pub qty_per: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl SubOrder {
    /// Full-position liquidation request (`qty_per == -100`).
    #[inline]
    pub fn is_liquidation(&self) -> bool {
        self.qty_per == Decimal::from(-100)
    }
}

/// Expand a payload into priority-ordered sub-orders.
pub fn expand(raw: &RawWebhook) -> Result<Vec<SubOrder>, RouterError> {
    let mut out = match &raw.orders {
        Some(orders) => {
            if orders.is_empty() {
                return Err(RouterError::InvalidPayload("orders is empty".into()));
            }
            orders
                .iter()
                .map(|sub| {
                    validate_one(
                        sub.symbol.as_deref().or(raw.symbol.as_deref()),
                        sub.side,
                        sub.order_type,
                        sub.qty_per,
                        sub.price,
                        sub.stop_price,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let order_type = raw
                .order_type
                .ok_or_else(|| RouterError::InvalidPayload("order_type is required".into()))?;
            vec![validate_one(
                raw.symbol.as_deref(),
                raw.side,
                order_type,
                raw.qty_per,
                raw.price,
                raw.stop_price,
            )?]
        }
    };

    // Stable sort keeps payload order inside each priority class.
    out.sort_by_key(|sub| sub.order_type.priority());
    Ok(out)
}

fn validate_one(
    symbol: Option<&str>,
    side: Option<Side>,
    order_type: OrderType,
    qty_per: Option<Decimal>,
    price: Option<Decimal>,
    stop_price: Option<Decimal>,
) -> Result<SubOrder, RouterError> {
    let symbol = symbol
        .ok_or_else(|| RouterError::InvalidPayload("symbol is required".into()))?
        .to_string();
    if !symbols::symbol_ok(&symbol) {
        return Err(RouterError::InvalidSymbol(symbol));
    }

    if order_type == OrderType::CancelAllOrder {
        return Ok(SubOrder {
            symbol,
            side,
            order_type,
            qty_per: Decimal::ZERO,
            price: None,
            stop_price: None,
        });
    }

    let side = side.ok_or_else(|| RouterError::InvalidPayload("side is required".into()))?;
    let qty_per =
        qty_per.ok_or_else(|| RouterError::InvalidPayload("qty_per is required".into()))?;
    if qty_per <= Decimal::ZERO && qty_per != Decimal::from(-100) {
        return Err(RouterError::InvalidPayload(format!(
            "qty_per must be positive or -100, got {qty_per}"
        )));
    }

    let requires_price = matches!(order_type, OrderType::Limit | OrderType::StopLimit);
    let requires_stop = matches!(order_type, OrderType::StopMarket | OrderType::StopLimit);

    if requires_price {
        let p = price.ok_or_else(|| {
            RouterError::InvalidPayload(format!("price is required for {order_type}"))
        })?;
        if p <= Decimal::ZERO {
            return Err(RouterError::InvalidPayload("price must be positive".into()));
        }
    }
    if requires_stop {
        let p = stop_price.ok_or_else(|| {
            RouterError::InvalidPayload(format!("stop_price is required for {order_type}"))
        })?;
        if p <= Decimal::ZERO {
            return Err(RouterError::InvalidPayload(
                "stop_price must be positive".into(),
            ));
        }
    }

    Ok(SubOrder {
        symbol,
        side: Some(side),
        order_type,
        qty_per,
        price: if requires_price { price } else { None },
        stop_price: if requires_stop { stop_price } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(json: &str) -> RawWebhook {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_single_limit_order() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"buy",
                "order_type":"LIMIT","qty_per":10,"price":50000}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].symbol, "BTC/USDT");
        assert_eq!(subs[0].side, Some(Side::Buy));
        assert_eq!(subs[0].order_type, OrderType::Limit);
        assert_eq!(subs[0].qty_per, dec!(10));
        assert_eq!(subs[0].price, Some(dec!(50000)));
    }

    #[test]
    fn test_limit_requires_price() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"buy",
                "order_type":"LIMIT","qty_per":10}"#,
        );
        assert!(matches!(
            expand(&payload),
            Err(RouterError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_stop_limit_requires_both() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"sell",
                "order_type":"STOP_LIMIT","qty_per":5,"price":49000}"#,
        );
        assert!(expand(&payload).is_err());

        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"sell",
                "order_type":"STOP_LIMIT","qty_per":5,"price":49000,"stop_price":49500}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].stop_price, Some(dec!(49500)));
    }

    #[test]
    fn test_cancel_all_needs_only_symbol() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT",
                "order_type":"CANCEL_ALL_ORDER"}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].order_type, OrderType::CancelAllOrder);
        assert_eq!(subs[0].side, None);

        // optional side filter survives
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"buy",
                "order_type":"CANCEL_ALL_ORDER"}"#,
        );
        assert_eq!(expand(&payload).unwrap()[0].side, Some(Side::Buy));
    }

    #[test]
    fn test_liquidation_qty_per() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"sell",
                "order_type":"MARKET","qty_per":-100}"#,
        );
        let subs = expand(&payload).unwrap();
        assert!(subs[0].is_liquidation());

        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","side":"sell",
                "order_type":"MARKET","qty_per":-50}"#,
        );
        assert!(expand(&payload).is_err());
    }

    #[test]
    fn test_batch_priority_reorder() {
        // LIMIT@105000, CANCEL_ALL, LIMIT@104000 -> CANCEL_ALL first,
        // then the LIMITs in payload order
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","orders":[
                {"side":"buy","order_type":"LIMIT","qty_per":10,"price":105000},
                {"order_type":"CANCEL_ALL_ORDER"},
                {"side":"buy","order_type":"LIMIT","qty_per":10,"price":104000}
            ]}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].order_type, OrderType::CancelAllOrder);
        assert_eq!(subs[1].price, Some(dec!(105000)));
        assert_eq!(subs[2].price, Some(dec!(104000)));
    }

    #[test]
    fn test_batch_inherits_top_level_symbol() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"ETH/USDT","orders":[
                {"side":"buy","order_type":"MARKET","qty_per":10},
                {"symbol":"BTC/USDT","side":"buy","order_type":"MARKET","qty_per":10}
            ]}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].symbol, "ETH/USDT");
        assert_eq!(subs[1].symbol, "BTC/USDT");
    }

    #[test]
    fn test_market_before_cancel_in_batch() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"BTC/USDT","orders":[
                {"order_type":"CANCEL_ALL_ORDER"},
                {"side":"sell","order_type":"MARKET","qty_per":-100},
                {"side":"buy","order_type":"STOP_MARKET","qty_per":5,"stop_price":51000}
            ]}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].order_type, OrderType::Market);
        assert_eq!(subs[1].order_type, OrderType::CancelAllOrder);
        assert_eq!(subs[2].order_type, OrderType::StopMarket);
    }

    #[test]
    fn test_bad_symbol_rejected() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"btc-usdt","side":"buy",
                "order_type":"MARKET","qty_per":10}"#,
        );
        assert!(matches!(
            expand(&payload),
            Err(RouterError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let payload = raw(r#"{"group_name":"g1","token":"T","orders":[]}"#);
        assert!(expand(&payload).is_err());
    }

    #[test]
    fn test_securities_symbol_accepted() {
        let payload = raw(
            r#"{"group_name":"g1","token":"T","symbol":"AAPL","side":"buy",
                "order_type":"MARKET","qty_per":10}"#,
        );
        let subs = expand(&payload).unwrap();
        assert_eq!(subs[0].symbol, "AAPL");
    }
}
