//! Core type definitions shared across the router.
//!
//! Status enums are stored in PostgreSQL as SMALLINT, so every enum here
//! carries `id()` / `from_id()` round-trips.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database row identifiers.
pub type AccountId = i64;
pub type StrategyId = i64;
pub type StrategyAccountId = i64;
pub type OrderId = i64;

/// Supported exchange venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i16)]
pub enum ExchangeId {
    Binance = 1,
    Bybit = 2,
    Upbit = 3,
    Bithumb = 4,
}

impl ExchangeId {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(ExchangeId::Binance),
            2 => Some(ExchangeId::Bybit),
            3 => Some(ExchangeId::Upbit),
            4 => Some(ExchangeId::Bithumb),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "BINANCE",
            ExchangeId::Bybit => "BYBIT",
            ExchangeId::Upbit => "UPBIT",
            ExchangeId::Bithumb => "BITHUMB",
        }
    }

    /// Domestic venues settle in KRW, overseas in USDT.
    #[inline]
    pub fn is_domestic(&self) -> bool {
        matches!(self, ExchangeId::Upbit | ExchangeId::Bithumb)
    }

    /// Quote currency used for capital allocation on this venue.
    pub fn quote_currency(&self) -> &'static str {
        if self.is_domestic() { "KRW" } else { "USDT" }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(ExchangeId::Binance),
            "BYBIT" => Ok(ExchangeId::Bybit),
            "UPBIT" => Ok(ExchangeId::Upbit),
            "BITHUMB" => Ok(ExchangeId::Bithumb),
            _ => Err(()),
        }
    }
}

/// Market segment a strategy trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i16)]
pub enum MarketType {
    Spot = 1,
    Futures = 2,
}

impl MarketType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(MarketType::Spot),
            2 => Some(MarketType::Futures),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "FUTURES",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Side {
    Buy = 1,
    Sell = 2,
}

impl Side {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Side::Buy),
            2 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    #[inline]
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order types accepted at the webhook and dispatched to venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum OrderType {
    Market = 1,
    Limit = 2,
    StopMarket = 3,
    StopLimit = 4,
    CancelAllOrder = 5,
}

impl OrderType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(OrderType::Market),
            2 => Some(OrderType::Limit),
            3 => Some(OrderType::StopMarket),
            4 => Some(OrderType::StopLimit),
            5 => Some(OrderType::CancelAllOrder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::StopLimit => "STOP_LIMIT",
            OrderType::CancelAllOrder => "CANCEL_ALL_ORDER",
        }
    }

    /// Dispatch priority inside a batch. Lower runs first:
    /// MARKET > CANCEL_ALL_ORDER > LIMIT > STOP_MARKET ~ STOP_LIMIT.
    pub fn priority(&self) -> u8 {
        match self {
            OrderType::Market => 0,
            OrderType::CancelAllOrder => 1,
            OrderType::Limit => 2,
            OrderType::StopMarket | OrderType::StopLimit => 3,
        }
    }

    /// MARKET and CANCEL_ALL_ORDER complete inside the HTTP request.
    #[inline]
    pub fn is_fast_path(&self) -> bool {
        matches!(self, OrderType::Market | OrderType::CancelAllOrder)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order lifecycle states.
///
/// `PENDING` and `FAILED` are internal; the externally published
/// vocabulary is NEW/OPEN/PARTIALLY_FILLED/FILLED/CANCELLED.
/// Terminal states: FILLED (40), CANCELLED (50), FAILED (-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum OrderStatus {
    /// Row exists, exchange has not yet assigned an id (DB-first pattern).
    Pending = 0,
    /// Acknowledged by the exchange.
    New = 10,
    /// Resting on the book.
    Open = 20,
    PartiallyFilled = 30,
    Filled = 40,
    Cancelled = 50,
    Failed = -10,
}

impl OrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Pending),
            10 => Some(OrderStatus::New),
            20 => Some(OrderStatus::Open),
            30 => Some(OrderStatus::PartiallyFilled),
            40 => Some(OrderStatus::Filled),
            50 => Some(OrderStatus::Cancelled),
            -10 => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::New => "NEW",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// State-machine oracle. Backward transitions are rejected (caller
    /// drops the event silently).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return false;
        }
        match self {
            Pending => matches!(next, New | Open | PartiallyFilled | Filled | Cancelled | Failed),
            New => matches!(next, Open | PartiallyFilled | Filled | Cancelled | Failed),
            Open => matches!(next, PartiallyFilled | Filled | Cancelled | Failed),
            PartiallyFilled => matches!(next, Filled | Cancelled | Failed),
            Filled | Cancelled | Failed => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cancel-queue row states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum CancelStatus {
    Pending = 0,
    Processing = 10,
    Success = 20,
    Failed = -10,
}

impl CancelStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(CancelStatus::Pending),
            10 => Some(CancelStatus::Processing),
            20 => Some(CancelStatus::Success),
            -10 => Some(CancelStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancelStatus::Pending => "PENDING",
            CancelStatus::Processing => "PROCESSING",
            CancelStatus::Success => "SUCCESS",
            CancelStatus::Failed => "FAILED",
        }
    }

    #[inline]
    pub fn is_inflight(&self) -> bool {
        matches!(self, CancelStatus::Pending | CancelStatus::Processing)
    }
}

impl fmt::Display for CancelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failed-order queue: which operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OperationType {
    Create = 1,
    Cancel = 2,
}

impl OperationType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(OperationType::Create),
            2 => Some(OperationType::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sentinel prefix used while the exchange has not yet assigned an order id.
pub const PENDING_SENTINEL_PREFIX: &str = "PENDING:";

/// Build a fresh `PENDING:<uuid>` sentinel.
pub fn pending_sentinel() -> String {
    format!("{}{}", PENDING_SENTINEL_PREFIX, uuid::Uuid::new_v4())
}

/// True if `exchange_order_id` is a pre-assignment placeholder.
#[inline]
pub fn is_pending_sentinel(exchange_order_id: &str) -> bool {
    exchange_order_id.starts_with(PENDING_SENTINEL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());

        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_state_id_roundtrip() {
        let states = [
            OrderStatus::Pending,
            OrderStatus::New,
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ];
        for state in states {
            assert_eq!(OrderStatus::from_id(state.id()), Some(state));
        }
        assert!(OrderStatus::from_id(999).is_none());
    }

    #[test]
    fn test_forward_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(New));
        assert!(Pending.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Failed));
        assert!(New.can_transition_to(PartiallyFilled));
        assert!(Open.can_transition_to(Filled));
        assert!(PartiallyFilled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use OrderStatus::*;
        assert!(!Filled.can_transition_to(Open));
        assert!(!Cancelled.can_transition_to(New));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!PartiallyFilled.can_transition_to(New));
        assert!(!Open.can_transition_to(Pending));
        // Self-transition is a no-op
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn test_batch_priority_ordering() {
        assert!(OrderType::Market.priority() < OrderType::CancelAllOrder.priority());
        assert!(OrderType::CancelAllOrder.priority() < OrderType::Limit.priority());
        assert!(OrderType::Limit.priority() < OrderType::StopMarket.priority());
        assert_eq!(
            OrderType::StopMarket.priority(),
            OrderType::StopLimit.priority()
        );
    }

    #[test]
    fn test_pending_sentinel() {
        let s = pending_sentinel();
        assert!(is_pending_sentinel(&s));
        assert!(!is_pending_sentinel("1234567890"));
        // Two sentinels never collide
        assert_ne!(pending_sentinel(), pending_sentinel());
    }

    #[test]
    fn test_exchange_quote_currency() {
        assert_eq!(ExchangeId::Binance.quote_currency(), "USDT");
        assert_eq!(ExchangeId::Bybit.quote_currency(), "USDT");
        assert_eq!(ExchangeId::Upbit.quote_currency(), "KRW");
        assert_eq!(ExchangeId::Bithumb.quote_currency(), "KRW");
    }

    #[test]
    fn test_serde_side_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        let s: Side = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn test_serde_order_type_screaming() {
        let t: OrderType = serde_json::from_str("\"CANCEL_ALL_ORDER\"").unwrap();
        assert_eq!(t, OrderType::CancelAllOrder);
        assert_eq!(
            serde_json::to_string(&OrderType::StopMarket).unwrap(),
            "\"STOP_MARKET\""
        );
    }
}
