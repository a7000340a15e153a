//! L4: orphan and capital sweeper.
//!
//! Every sweep: (a) PENDING rows older than the orphan timeout become
//! FAILED with a FailedOrder(CREATE, "orphan-timeout") record — this is
//! what makes the DB-first pattern crash-safe; (b) when enabled, capital
//! allocations are rebalanced pro-rata by weight against live account
//! equity; (c) the daily report fires once per UTC day at the configured
//! hour.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core_types::AccountId;
use crate::notify::NotifyEvent;
use crate::store::{accounts, orders};

use super::ReconcileCtx;

pub async fn run(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.sweep_interval_secs.max(1));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "sweeper started");

    let mut last_report_day: Option<u32> = None;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                sweep_once(&ctx, &mut last_report_day).await;
            }
            _ = shutdown.changed() => {
                info!("sweeper stopping");
                return;
            }
        }
    }
}

async fn sweep_once(ctx: &ReconcileCtx, last_report_day: &mut Option<u32>) {
    // (a) orphaned PENDING rows
    let timeout = chrono::Duration::seconds(ctx.config.orphan_timeout_secs as i64);
    match orders::sweep_orphans(&ctx.db, timeout).await {
        Ok(swept) => {
            for order in swept {
                warn!(
                    order_id = order.id,
                    symbol = %order.symbol,
                    "orphaned PENDING order failed"
                );
                ctx.notifier
                    .notify(NotifyEvent::OrderFailed {
                        strategy_account_id: order.strategy_account_id,
                        symbol: order.symbol,
                        reason: "orphan-timeout".to_string(),
                    })
                    .await;
            }
        }
        Err(e) => warn!(error = %e, "orphan sweep failed"),
    }

    // (b) capital auto-rebalance
    if ctx.rebalance.enabled {
        if let Err(e) = rebalance_capital(ctx).await {
            warn!(error = %e, "capital rebalance failed");
        }
    }

    // (c) daily report, once per UTC day
    let now = Utc::now();
    if now.hour() == ctx.config.daily_report_hour && *last_report_day != Some(now.ordinal()) {
        *last_report_day = Some(now.ordinal());
        match accounts::strategy_pnl_summary(&ctx.db).await {
            Ok(strategy_pnl) => {
                ctx.notifier
                    .notify(NotifyEvent::DailyReport {
                        date: now,
                        strategy_pnl,
                    })
                    .await;
            }
            Err(e) => warn!(error = %e, "daily report query failed"),
        }
    }
}

/// Rebalance allocations: each account's equity is split across its
/// subscriptions pro-rata by weight (scaled by the target utilization),
/// and a subscription is updated only when its current allocation
/// deviates more than epsilon from that target.
async fn rebalance_capital(ctx: &ReconcileCtx) -> Result<(), crate::error::RouterError> {
    let subscriptions = accounts::all_active_subscriptions(&ctx.db).await?;
    if subscriptions.is_empty() {
        return Ok(());
    }

    // Group subscriptions per account and fetch equity once per account.
    let mut by_account: HashMap<AccountId, Vec<&crate::store::models::Subscription>> =
        HashMap::new();
    for sub in &subscriptions {
        by_account.entry(sub.account.id).or_default().push(sub);
    }

    let epsilon = Decimal::from_f64(ctx.rebalance.epsilon).unwrap_or(Decimal::new(1, 1));
    let target_util = Decimal::from_f64(ctx.rebalance.target_utilization).unwrap_or(Decimal::ONE);

    for (account_id, subs) in by_account {
        let account = &subs[0].account;
        let adapter = ctx.adapters.adapter_for(account);
        // Market segment: strategies on this account may differ, but
        // equity is account-level; spot balance covers domestic venues
        // and unified accounts report one figure anyway.
        let balance = match adapter
            .fetch_balance(crate::core_types::MarketType::Spot)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(account_id, error = %e, "balance fetch failed, skipping rebalance");
                continue;
            }
        };
        let equity = balance.total * target_util;
        if equity <= Decimal::ZERO {
            continue;
        }

        let total_weight: Decimal = subs.iter().map(|s| s.weight).sum();
        if total_weight <= Decimal::ZERO {
            continue;
        }

        for sub in subs {
            let target = equity * sub.weight / total_weight;
            let current = accounts::capital_for(&ctx.db, sub.strategy_account_id)
                .await?
                .map(|c| c.allocated_capital)
                .unwrap_or(Decimal::ZERO);

            let deviates = if target.is_zero() {
                !current.is_zero()
            } else {
                ((current - target) / target).abs() > epsilon
            };
            if deviates {
                info!(
                    strategy_account_id = sub.strategy_account_id,
                    %current,
                    %target,
                    "rebalancing allocation"
                );
                accounts::set_allocated_capital(&ctx.db, sub.strategy_account_id, target).await?;
            }
        }
    }
    Ok(())
}
