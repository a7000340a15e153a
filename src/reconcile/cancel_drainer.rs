//! L3: cancel-queue drainer.
//!
//! Claims a batch of due PENDING cancels (atomically flipped to
//! PROCESSING), calls the venue, and settles each row: SUCCESS leaves
//! the open order to L1/L2, venue Conflict/NotFound parks the row as
//! FAILED without forcing the order backward, and anything else retries
//! with exponential backoff until `max_cancel_retries`, after which a
//! FailedOrder(CANCEL) is recorded.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::core_types::{CancelStatus, OperationType};
use crate::error::ExchangeError;
use crate::store::failed_orders::FailedOrderEntry;
use crate::store::{accounts, cancel_queue, failed_orders, orders};

use super::ReconcileCtx;

const CLAIM_LIMIT: i64 = 50;
/// PROCESSING rows older than this belong to a dead drainer.
const STALE_PROCESSING: chrono::Duration = chrono::Duration::minutes(10);

pub async fn run(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.cancel_queue_interval_secs.max(1));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "cancel drainer started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = drain_once(&ctx).await {
                    warn!(error = %e, "cancel drain cycle failed");
                }
            }
            _ = shutdown.changed() => {
                info!("cancel drainer stopping");
                return;
            }
        }
    }
}

pub async fn drain_once(ctx: &ReconcileCtx) -> Result<(), crate::error::RouterError> {
    let reaped = cancel_queue::reap_stale_processing(&ctx.db, STALE_PROCESSING).await?;
    if reaped > 0 {
        warn!(reaped, "returned stale PROCESSING cancels to PENDING");
    }

    let batch = cancel_queue::claim_batch(&ctx.db, CLAIM_LIMIT).await?;
    for request in batch {
        if let Err(e) = settle_one(ctx, &request).await {
            warn!(cancel_id = request.id, error = %e, "cancel settle failed");
        }
    }
    Ok(())
}

async fn settle_one(
    ctx: &ReconcileCtx,
    request: &crate::store::models::CancelRequest,
) -> Result<(), crate::error::RouterError> {
    let Some(order) = orders::get(&ctx.db, request.order_id).await? else {
        cancel_queue::mark_success(&ctx.db, request.id).await?;
        return Ok(());
    };

    // Already settled by the feed: nothing to cancel.
    if order.status.is_terminal() {
        cancel_queue::mark_success(&ctx.db, request.id).await?;
        return Ok(());
    }

    let Some(subscription) = accounts::subscription(&ctx.db, order.strategy_account_id).await?
    else {
        cancel_queue::mark_success(&ctx.db, request.id).await?;
        return Ok(());
    };
    let adapter = ctx.adapters.adapter_for(&subscription.account);

    match adapter
        .cancel_order(&order.exchange_order_id, &order.symbol, order.market_type)
        .await
    {
        Ok(()) => {
            // L1/L2 advance the open order to CANCELLED.
            cancel_queue::mark_success(&ctx.db, request.id).await?;
        }
        Err(ExchangeError::NotFound(msg)) | Err(ExchangeError::Conflict(msg)) => {
            // The venue disagrees about the order's state; the feed is
            // authoritative, the cancel request itself is dead.
            warn!(order_id = order.id, %msg, "cancel conflicted, parking request");
            park_failed(ctx, request, &order, &msg).await?;
        }
        Err(e) => {
            let backoff = cancel_queue::backoff_for_attempt(request.retry_count);
            let status = cancel_queue::mark_attempt_failed(
                &ctx.db,
                request.id,
                request.retry_count,
                ctx.config.max_cancel_retries,
                backoff,
            )
            .await?;
            if status == CancelStatus::Failed {
                park_failed(ctx, request, &order, &e.to_string()).await?;
            }
        }
    }
    Ok(())
}

/// Mark the request FAILED (if not already) and record the operator
/// surface entry.
async fn park_failed(
    ctx: &ReconcileCtx,
    request: &crate::store::models::CancelRequest,
    order: &crate::store::models::OpenOrder,
    note: &str,
) -> Result<(), crate::error::RouterError> {
    cancel_queue::mark_attempt_failed(
        &ctx.db,
        request.id,
        ctx.config.max_cancel_retries, // force past the cap
        ctx.config.max_cancel_retries,
        chrono::Duration::zero(),
    )
    .await?;

    failed_orders::insert(
        &ctx.db,
        &FailedOrderEntry {
            strategy_account_id: order.strategy_account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.remaining(),
            price: order.price,
            stop_price: order.stop_price,
            reason: "cancel-failed".to_string(),
            exchange_error: Some(note.to_string()),
            operation_type: OperationType::Cancel,
            original_order_id: Some(order.id),
        },
    )
    .await?;
    Ok(())
}
