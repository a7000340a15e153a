//! Store row types and their sqlx row conversions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::core_types::{
    AccountId, CancelStatus, ExchangeId, MarketType, OperationType, OrderId, OrderStatus,
    OrderType, Side, StrategyAccountId, StrategyId,
};
use crate::error::RouterError;

fn enum_err(what: &str, id: i16) -> RouterError {
    RouterError::Database(format!("corrupt {what} id {id}"))
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub user_id: i64,
    pub exchange: ExchangeId,
    pub name: String,
    pub public_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
    pub is_active: bool,
    pub is_testnet: bool,
}

impl Account {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        let exchange_id: i16 = row.get("exchange");
        Ok(Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            exchange: ExchangeId::from_id(exchange_id)
                .ok_or_else(|| enum_err("exchange", exchange_id))?,
            name: row.get("name"),
            public_key: row.get("public_key"),
            secret_key: row.get("secret_key"),
            passphrase: row.get("passphrase"),
            is_active: row.get("is_active"),
            is_testnet: row.get("is_testnet"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: StrategyId,
    pub user_id: i64,
    pub group_name: String,
    pub market_type: MarketType,
    pub webhook_token: String,
    pub is_active: bool,
    pub is_public: bool,
}

impl Strategy {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        let market_id: i16 = row.get("market_type");
        Ok(Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            group_name: row.get("group_name"),
            market_type: MarketType::from_id(market_id)
                .ok_or_else(|| enum_err("market_type", market_id))?,
            webhook_token: row.get("webhook_token"),
            is_active: row.get("is_active"),
            is_public: row.get("is_public"),
        })
    }
}

/// One (strategy, account) subscription edge with the joined account.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub strategy_account_id: StrategyAccountId,
    pub strategy_id: StrategyId,
    pub weight: Decimal,
    pub leverage: u32,
    pub max_symbols: Option<i32>,
    pub account: Account,
}

#[derive(Debug, Clone)]
pub struct StrategyCapital {
    pub strategy_account_id: StrategyAccountId,
    pub allocated_capital: Decimal,
    pub current_pnl: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl StrategyCapital {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        Ok(Self {
            strategy_account_id: row.get("strategy_account_id"),
            allocated_capital: row.get("allocated_capital"),
            current_pnl: row.get("current_pnl"),
            last_updated: row.get("last_updated"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StrategyPosition {
    pub strategy_account_id: StrategyAccountId,
    pub symbol: String,
    /// Signed: > 0 long, < 0 short, 0 flat.
    pub quantity: Decimal,
    /// Quantity-weighted average over non-reducing fills.
    pub entry_price: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl StrategyPosition {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        Ok(Self {
            strategy_account_id: row.get("strategy_account_id"),
            symbol: row.get("symbol"),
            quantity: row.get("quantity"),
            entry_price: row.get("entry_price"),
            last_updated: row.get("last_updated"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: OrderId,
    pub strategy_account_id: StrategyAccountId,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub market_type: MarketType,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OpenOrder {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        let side_id: i16 = row.get("side");
        let type_id: i16 = row.get("order_type");
        let status_id: i16 = row.get("status");
        let market_id: i16 = row.get("market_type");
        Ok(Self {
            id: row.get("id"),
            strategy_account_id: row.get("strategy_account_id"),
            exchange_order_id: row.get("exchange_order_id"),
            symbol: row.get("symbol"),
            side: Side::from_id(side_id).ok_or_else(|| enum_err("side", side_id))?,
            order_type: OrderType::from_id(type_id)
                .ok_or_else(|| enum_err("order_type", type_id))?,
            price: row.get("price"),
            stop_price: row.get("stop_price"),
            quantity: row.get("quantity"),
            filled_quantity: row.get("filled_quantity"),
            status: OrderStatus::from_id(status_id)
                .ok_or_else(|| enum_err("status", status_id))?,
            market_type: MarketType::from_id(market_id)
                .ok_or_else(|| enum_err("market_type", market_id))?,
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
        })
    }

    #[inline]
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub strategy_account_id: StrategyAccountId,
    pub exchange_order_id: String,
    pub fill_seq: i64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub order_price: Option<Decimal>,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_at: DateTime<Utc>,
    pub pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub is_entry: bool,
    pub market_type: MarketType,
}

#[derive(Debug, Clone)]
pub struct FailedOrder {
    pub id: i64,
    pub strategy_account_id: StrategyAccountId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reason: String,
    pub exchange_error: Option<String>,
    pub operation_type: OperationType,
    pub original_order_id: Option<OrderId>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl FailedOrder {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        let side_id: i16 = row.get("side");
        let type_id: i16 = row.get("order_type");
        let op_id: i16 = row.get("operation_type");
        Ok(Self {
            id: row.get("id"),
            strategy_account_id: row.get("strategy_account_id"),
            symbol: row.get("symbol"),
            side: Side::from_id(side_id).ok_or_else(|| enum_err("side", side_id))?,
            order_type: OrderType::from_id(type_id)
                .ok_or_else(|| enum_err("order_type", type_id))?,
            quantity: row.get("quantity"),
            price: row.get("price"),
            stop_price: row.get("stop_price"),
            reason: row.get("reason"),
            exchange_error: row.get("exchange_error"),
            operation_type: OperationType::from_id(op_id)
                .ok_or_else(|| enum_err("operation_type", op_id))?,
            original_order_id: row.get("original_order_id"),
            retry_count: row.get("retry_count"),
            created_at: row.get("created_at"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub id: i64,
    pub order_id: OrderId,
    pub strategy_id: StrategyId,
    pub account_id: AccountId,
    pub retry_count: i32,
    pub status: CancelStatus,
}

impl CancelRequest {
    pub fn from_row(row: &PgRow) -> Result<Self, RouterError> {
        let status_id: i16 = row.get("status");
        Ok(Self {
            id: row.get("id"),
            order_id: row.get("order_id"),
            strategy_id: row.get("strategy_id"),
            account_id: row.get("account_id"),
            retry_count: row.get("retry_count"),
            status: CancelStatus::from_id(status_id)
                .ok_or_else(|| enum_err("cancel status", status_id))?,
        })
    }
}
