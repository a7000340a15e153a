//! Failed-order queue.
//!
//! Populated on CREATE or CANCEL failure; retries are an operator
//! decision, nothing in-process re-dispatches CREATE failures.

use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::core_types::{OperationType, OrderId, OrderType, Side, StrategyAccountId};
use crate::error::RouterError;

use super::Database;
use super::models::FailedOrder;

/// Parameters for one failed-order record.
#[derive(Debug, Clone)]
pub struct FailedOrderEntry {
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
}

/// Insert within a caller-owned transaction (used by fail_pending and the
/// orphan sweeper so the status flip and the record land together).
pub async fn insert_in(
    conn: &mut PgConnection,
    entry: &FailedOrderEntry,
) -> Result<(), RouterError> {
    sqlx::query(
        r#"
        INSERT INTO failed_orders_tb
            (strategy_account_id, symbol, side, order_type, quantity, price,
             stop_price, reason, exchange_error, operation_type, original_order_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(entry.strategy_account_id)
    .bind(&entry.symbol)
    .bind(entry.side.id())
    .bind(entry.order_type.id())
    .bind(entry.quantity)
    .bind(entry.price)
    .bind(entry.stop_price)
    .bind(&entry.reason)
    .bind(&entry.exchange_error)
    .bind(entry.operation_type.id())
    .bind(entry.original_order_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert(db: &Database, entry: &FailedOrderEntry) -> Result<(), RouterError> {
    let mut conn = db.pool().acquire().await?;
    insert_in(&mut conn, entry).await
}


impl FailedOrderEntry {
    /// Entry describing a CREATE failure for an order that already has a
    /// durable row.
    pub fn for_order(
        order: &super::models::OpenOrder,
        reason: impl Into<String>,
        exchange_error: Option<String>,
    ) -> Self {
        Self {
            strategy_account_id: order.strategy_account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_price: order.stop_price,
            reason: reason.into(),
            exchange_error,
            operation_type: OperationType::Create,
            original_order_id: Some(order.id),
        }
    }
}

/// Recent failures, newest first (operator surface).
pub async fn recent(db: &Database, limit: i64) -> Result<Vec<FailedOrder>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT id, strategy_account_id, symbol, side, order_type, quantity, price,
               stop_price, reason, exchange_error, operation_type, original_order_id,
               retry_count, created_at
        FROM failed_orders_tb
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(FailedOrder::from_row).collect()
}
