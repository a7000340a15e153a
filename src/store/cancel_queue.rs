//! Cancel queue.
//!
//! One logical cancel request per open order. Enqueue is guarded by the
//! partial unique index (one PENDING/PROCESSING row per order); the
//! drainer claims batches atomically with `FOR UPDATE SKIP LOCKED`, so
//! replicated processes never double-claim.

use chrono::Utc;
use sqlx::Row;

use crate::core_types::{AccountId, CancelStatus, OrderId, StrategyId};
use crate::error::RouterError;

use super::Database;
use super::models::CancelRequest;

/// Enqueue a cancel iff no inflight request exists for the order.
/// Returns false when one was already queued.
pub async fn enqueue(
    db: &Database,
    order_id: OrderId,
    strategy_id: StrategyId,
    account_id: AccountId,
) -> Result<bool, RouterError> {
    let result = sqlx::query(
        r#"
        INSERT INTO cancel_queue_tb (order_id, strategy_id, account_id, status)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (order_id) WHERE status IN (0, 10) DO NOTHING
        "#,
    )
    .bind(order_id)
    .bind(strategy_id)
    .bind(account_id)
    .bind(CancelStatus::Pending.id())
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim up to `limit` due PENDING rows, flipping them to PROCESSING in
/// the same statement. Skip-locked keeps concurrent drainers disjoint.
pub async fn claim_batch(db: &Database, limit: i64) -> Result<Vec<CancelRequest>, RouterError> {
    let rows = sqlx::query(
        r#"
        UPDATE cancel_queue_tb
        SET status = $1, updated_at = NOW()
        WHERE id IN (
            SELECT id FROM cancel_queue_tb
            WHERE status = $2 AND next_attempt_at <= NOW()
            ORDER BY created_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, order_id, strategy_id, account_id, retry_count, status
        "#,
    )
    .bind(CancelStatus::Processing.id())
    .bind(CancelStatus::Pending.id())
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(CancelRequest::from_row).collect()
}

pub async fn mark_success(db: &Database, id: i64) -> Result<(), RouterError> {
    sqlx::query(
        r#"
        UPDATE cancel_queue_tb
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(CancelStatus::Success.id())
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Record a failed attempt: either back off for another PENDING round or,
/// past the retry cap, park the row as FAILED. Returns the new status.
pub async fn mark_attempt_failed(
    db: &Database,
    id: i64,
    retry_count: i32,
    max_retries: i32,
    backoff: chrono::Duration,
) -> Result<CancelStatus, RouterError> {
    let next_retry = retry_count + 1;
    if next_retry >= max_retries {
        sqlx::query(
            r#"
            UPDATE cancel_queue_tb
            SET status = $2, retry_count = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(CancelStatus::Failed.id())
        .bind(next_retry)
        .execute(db.pool())
        .await?;
        return Ok(CancelStatus::Failed);
    }

    sqlx::query(
        r#"
        UPDATE cancel_queue_tb
        SET status = $2, retry_count = $3, next_attempt_at = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(CancelStatus::Pending.id())
    .bind(next_retry)
    .bind(Utc::now() + backoff)
    .execute(db.pool())
    .await?;
    Ok(CancelStatus::Pending)
}

/// Exponential backoff for attempt `n` (0-based): base 30 s doubling.
pub fn backoff_for_attempt(attempt: i32) -> chrono::Duration {
    let capped = attempt.clamp(0, 10) as u32;
    chrono::Duration::seconds(30i64 << capped)
}

/// PROCESSING rows stranded by a crashed drainer, returned to PENDING
/// after `stale`, so a lost drainer never strands a cancel forever.
pub async fn reap_stale_processing(
    db: &Database,
    stale: chrono::Duration,
) -> Result<u64, RouterError> {
    let cutoff = Utc::now() - stale;
    let result = sqlx::query(
        r#"
        UPDATE cancel_queue_tb
        SET status = $1, updated_at = NOW()
        WHERE status = $2 AND updated_at < $3
        "#,
    )
    .bind(CancelStatus::Pending.id())
    .bind(CancelStatus::Processing.id())
    .bind(cutoff)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

/// Inflight row count for one order (test oracle).
pub async fn inflight_count(db: &Database, order_id: OrderId) -> Result<i64, RouterError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM cancel_queue_tb
        WHERE order_id = $1 AND status IN (0, 10)
        "#,
    )
    .bind(order_id)
    .fetch_one(db.pool())
    .await?;
    Ok(row.get("n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_30s() {
        assert_eq!(backoff_for_attempt(0), chrono::Duration::seconds(30));
        assert_eq!(backoff_for_attempt(1), chrono::Duration::seconds(60));
        assert_eq!(backoff_for_attempt(2), chrono::Duration::seconds(120));
        assert_eq!(backoff_for_attempt(3), chrono::Duration::seconds(240));
        // clamped, no overflow on absurd attempts
        assert_eq!(backoff_for_attempt(100), chrono::Duration::seconds(30 << 10));
    }
}
