//! Position bookkeeping.
//!
//! Positions are derived state: every applied fill moves
//! `strategy_positions_tb` under a row lock, inside the same transaction
//! that recorded the trade. Entry price is a quantity-weighted average
//! over non-reducing fills; reducing fills realize PnL and leave the
//! entry untouched; a flip through zero restarts the average on the
//! post-flip side.

use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::core_types::StrategyAccountId;
use crate::error::RouterError;

use super::Database;
use super::models::StrategyPosition;

/// Outcome of applying one signed fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    pub new_quantity: Decimal,
    pub new_entry_price: Decimal,
    /// Realized PnL on the reduced portion, zero for pure entries.
    pub realized_pnl: Decimal,
    /// True when the fill grew (or opened) the position.
    pub is_entry: bool,
}

/// Pure position math, shared by the SQL path and the tests.
pub fn merge_fill(
    old_qty: Decimal,
    old_entry: Decimal,
    delta: Decimal,
    fill_price: Decimal,
) -> FillOutcome {
    let new_qty = old_qty + delta;

    // Same sign (or opening from flat): growing position
    if old_qty.is_zero() || (old_qty.is_sign_positive() == delta.is_sign_positive()) {
        let total = old_qty.abs() + delta.abs();
        let entry = if total.is_zero() {
            Decimal::ZERO
        } else {
            (old_qty.abs() * old_entry + delta.abs() * fill_price) / total
        };
        return FillOutcome {
            new_quantity: new_qty,
            new_entry_price: entry,
            realized_pnl: Decimal::ZERO,
            is_entry: true,
        };
    }

    // Reducing (possibly through zero)
    let closed = old_qty.abs().min(delta.abs());
    let direction = if old_qty.is_sign_positive() {
        Decimal::ONE
    } else {
        -Decimal::ONE
    };
    let realized = (fill_price - old_entry) * closed * direction;

    if delta.abs() <= old_qty.abs() {
        // Plain reduction: entry unchanged (reset when flat)
        let entry = if new_qty.is_zero() { Decimal::ZERO } else { old_entry };
        FillOutcome {
            new_quantity: new_qty,
            new_entry_price: entry,
            realized_pnl: realized,
            is_entry: false,
        }
    } else {
        // Flip: residual opens on the other side at the fill price
        FillOutcome {
            new_quantity: new_qty,
            new_entry_price: fill_price,
            realized_pnl: realized,
            is_entry: false,
        }
    }
}

/// Apply a signed fill under a row lock. Must run inside the transaction
/// that inserts the corresponding trade row; the caller only gets here
/// after the trade insert succeeded, which keeps the update idempotent
/// under duplicate delivery.
pub async fn apply_fill(
    conn: &mut PgConnection,
    strategy_account_id: StrategyAccountId,
    symbol: &str,
    signed_delta: Decimal,
    fill_price: Decimal,
) -> Result<FillOutcome, RouterError> {
    // Ensure the row exists, then lock it.
    sqlx::query(
        r#"
        INSERT INTO strategy_positions_tb (strategy_account_id, symbol, quantity, entry_price)
        VALUES ($1, $2, 0, 0)
        ON CONFLICT (strategy_account_id, symbol) DO NOTHING
        "#,
    )
    .bind(strategy_account_id)
    .bind(symbol)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        r#"
        SELECT quantity, entry_price FROM strategy_positions_tb
        WHERE strategy_account_id = $1 AND symbol = $2
        FOR UPDATE
        "#,
    )
    .bind(strategy_account_id)
    .bind(symbol)
    .fetch_one(&mut *conn)
    .await?;

    let old_qty: Decimal = row.get("quantity");
    let old_entry: Decimal = row.get("entry_price");
    let outcome = merge_fill(old_qty, old_entry, signed_delta, fill_price);

    sqlx::query(
        r#"
        UPDATE strategy_positions_tb
        SET quantity = $3, entry_price = $4, last_updated = NOW()
        WHERE strategy_account_id = $1 AND symbol = $2
        "#,
    )
    .bind(strategy_account_id)
    .bind(symbol)
    .bind(outcome.new_quantity)
    .bind(outcome.new_entry_price)
    .execute(&mut *conn)
    .await?;

    if !outcome.realized_pnl.is_zero() {
        sqlx::query(
            r#"
            UPDATE strategy_capital_tb
            SET current_pnl = current_pnl + $2, last_updated = NOW()
            WHERE strategy_account_id = $1
            "#,
        )
        .bind(strategy_account_id)
        .bind(outcome.realized_pnl)
        .execute(&mut *conn)
        .await?;
    }

    Ok(outcome)
}

/// Current position, if a row exists.
pub async fn get_position(
    db: &Database,
    strategy_account_id: StrategyAccountId,
    symbol: &str,
) -> Result<Option<StrategyPosition>, RouterError> {
    let row: Option<PgRow> = sqlx::query(
        r#"
        SELECT strategy_account_id, symbol, quantity, entry_price, last_updated
        FROM strategy_positions_tb
        WHERE strategy_account_id = $1 AND symbol = $2
        "#,
    )
    .bind(strategy_account_id)
    .bind(symbol)
    .fetch_optional(db.pool())
    .await?;
    row.map(|r| StrategyPosition::from_row(&r)).transpose()
}

/// All non-flat positions for one subscription.
pub async fn positions_for(
    db: &Database,
    strategy_account_id: StrategyAccountId,
) -> Result<Vec<StrategyPosition>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT strategy_account_id, symbol, quantity, entry_price, last_updated
        FROM strategy_positions_tb
        WHERE strategy_account_id = $1 AND quantity != 0
        "#,
    )
    .bind(strategy_account_id)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(StrategyPosition::from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_from_flat() {
        let out = merge_fill(dec!(0), dec!(0), dec!(0.5), dec!(50000));
        assert_eq!(out.new_quantity, dec!(0.5));
        assert_eq!(out.new_entry_price, dec!(50000));
        assert_eq!(out.realized_pnl, dec!(0));
        assert!(out.is_entry);
    }

    #[test]
    fn test_add_averages_entry() {
        // 0.5 @ 50000 + 0.5 @ 52000 -> 1.0 @ 51000
        let out = merge_fill(dec!(0.5), dec!(50000), dec!(0.5), dec!(52000));
        assert_eq!(out.new_quantity, dec!(1.0));
        assert_eq!(out.new_entry_price, dec!(51000));
        assert!(out.is_entry);
    }

    #[test]
    fn test_reduce_keeps_entry_and_realizes_pnl() {
        // long 1.0 @ 50000, sell 0.4 @ 55000 -> pnl 2000
        let out = merge_fill(dec!(1.0), dec!(50000), dec!(-0.4), dec!(55000));
        assert_eq!(out.new_quantity, dec!(0.6));
        assert_eq!(out.new_entry_price, dec!(50000));
        assert_eq!(out.realized_pnl, dec!(2000));
        assert!(!out.is_entry);
    }

    #[test]
    fn test_full_close_resets_entry() {
        let out = merge_fill(dec!(0.5), dec!(50000), dec!(-0.5), dec!(51000));
        assert_eq!(out.new_quantity, dec!(0));
        assert_eq!(out.new_entry_price, dec!(0));
        assert_eq!(out.realized_pnl, dec!(500));
    }

    #[test]
    fn test_flip_through_zero() {
        // long 0.5 @ 50000, sell 0.8 @ 52000: close 0.5 (pnl 1000),
        // short 0.3 entered at 52000
        let out = merge_fill(dec!(0.5), dec!(50000), dec!(-0.8), dec!(52000));
        assert_eq!(out.new_quantity, dec!(-0.3));
        assert_eq!(out.new_entry_price, dec!(52000));
        assert_eq!(out.realized_pnl, dec!(1000));
    }

    #[test]
    fn test_short_side_pnl_sign() {
        // short 1.0 @ 3000, buy back 1.0 @ 2900 -> pnl +100
        let out = merge_fill(dec!(-1.0), dec!(3000), dec!(1.0), dec!(2900));
        assert_eq!(out.new_quantity, dec!(0));
        assert_eq!(out.realized_pnl, dec!(100));
    }

    #[test]
    fn test_short_add_averages() {
        let out = merge_fill(dec!(-1.0), dec!(3000), dec!(-1.0), dec!(3100));
        assert_eq!(out.new_quantity, dec!(-2.0));
        assert_eq!(out.new_entry_price, dec!(3050));
        assert!(out.is_entry);
    }
}
