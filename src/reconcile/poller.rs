//! L2: REST poller, the authoritative fallback.
//!
//! The private WS can drop events silently; every `poll_interval` the
//! poller snapshots each tracked non-terminal order and the recent
//! executions on its symbol, and pushes both through the same ingestion
//! path as L1. Idempotency comes from the store, not from the poller.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core_types::{OrderStatus, StrategyAccountId, is_pending_sentinel};
use crate::error::ExchangeError;
use crate::exchange::OrderFeedEvent;
use crate::store::{accounts, orders};

use super::{ReconcileCtx, ingest_event};

pub async fn run(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.poll_interval_secs.max(1));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "poller started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = poll_once(&ctx).await {
                    // Transient poller errors: log and continue.
                    warn!(error = %e, "poll cycle failed");
                }
            }
            _ = shutdown.changed() => {
                info!("poller stopping");
                return;
            }
        }
    }
}

pub async fn poll_once(ctx: &ReconcileCtx) -> Result<(), crate::error::RouterError> {
    let open = orders::non_terminal(&ctx.db).await?;
    if open.is_empty() {
        return Ok(());
    }

    // Group per subscription so credentials resolve once.
    let mut by_subscription: HashMap<StrategyAccountId, Vec<&crate::store::models::OpenOrder>> =
        HashMap::new();
    for order in &open {
        by_subscription
            .entry(order.strategy_account_id)
            .or_default()
            .push(order);
    }

    for (sa_id, sa_orders) in by_subscription {
        let Some(subscription) = accounts::subscription(&ctx.db, sa_id).await? else {
            continue;
        };
        if !subscription.account.is_active {
            continue;
        }
        let adapter = ctx.adapters.adapter_for(&subscription.account);

        let mut fill_symbols = std::collections::HashSet::new();
        for order in sa_orders {
            // PENDING rows have no venue id to poll; the sweeper owns them.
            if is_pending_sentinel(&order.exchange_order_id) {
                continue;
            }
            match adapter
                .fetch_order(&order.exchange_order_id, &order.symbol, order.market_type)
                .await
            {
                Ok(snap) => {
                    let event = OrderFeedEvent {
                        exchange_order_id: snap.exchange_order_id.clone(),
                        symbol: snap.symbol.clone(),
                        status: snap.status,
                        filled_qty: snap.filled_qty,
                        last_fill_qty: rust_decimal::Decimal::ZERO,
                        last_fill_price: snap.avg_price,
                        fee: None,
                        fill_seq: 0,
                    };
                    ingest_event(ctx, &event).await;
                }
                Err(ExchangeError::NotFound(_)) => {
                    // Acknowledged order the venue no longer reports:
                    // treat as cancelled rather than leaving it stuck.
                    if order.status != OrderStatus::Pending {
                        debug!(
                            exchange_order_id = %order.exchange_order_id,
                            "order vanished at venue, marking cancelled"
                        );
                        let event = OrderFeedEvent {
                            exchange_order_id: order.exchange_order_id.clone(),
                            symbol: order.symbol.clone(),
                            status: OrderStatus::Cancelled,
                            filled_qty: order.filled_quantity,
                            last_fill_qty: rust_decimal::Decimal::ZERO,
                            last_fill_price: None,
                            fee: None,
                            fill_seq: 0,
                        };
                        ingest_event(ctx, &event).await;
                    }
                }
                Err(e) => {
                    warn!(
                        exchange_order_id = %order.exchange_order_id,
                        error = %e,
                        "order poll failed"
                    );
                }
            }
            fill_symbols.insert((order.symbol.clone(), order.market_type));
        }

        // Per-execution events carry fees and exact prices the snapshot
        // path lacks; venues without an executions endpoint return [].
        for (symbol, market) in fill_symbols {
            match adapter.fetch_recent_fills(&symbol, market).await {
                Ok(events) => {
                    for event in events {
                        ingest_event(ctx, &event).await;
                    }
                }
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "recent-fills poll failed");
                }
            }
        }
    }

    Ok(())
}
