//! Reconciler: the four background loops.
//!
//! L1 ingests the private WS feeds, L2 polls REST as the authoritative
//! fallback, L3 drains the cancel queue, L4 sweeps orphaned PENDING rows
//! and rebalances capital. All four go through the order store's atomic
//! operations, so any number of replicated processes reconcile safely
//! against the shared database.

pub mod cancel_drainer;
pub mod poller;
pub mod private_feed;
pub mod sweeper;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{PipelineConfig, RebalanceConfig};
use crate::core_types::OrderStatus;
use crate::dispatch::AdapterPool;
use crate::exchange::OrderFeedEvent;
use crate::notify::{Notifier, NotifyEvent};
use crate::price_cache::PriceCache;
use crate::registry::SymbolRegistry;
use crate::store::{Database, orders};

/// Shared context for every loop.
#[derive(Clone)]
pub struct ReconcileCtx {
    pub db: Database,
    pub adapters: Arc<AdapterPool>,
    pub registry: Arc<SymbolRegistry>,
    pub price_cache: Arc<PriceCache>,
    pub notifier: Arc<dyn Notifier>,
    pub config: PipelineConfig,
    pub rebalance: RebalanceConfig,
}

/// Spawn L1–L4 plus the public price feeds. Returns the join set so the
/// binary can await task failure; loops exit when `shutdown` flips.
pub fn spawn_all(ctx: ReconcileCtx, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
    let mut set = JoinSet::new();

    set.spawn(private_feed::run(ctx.clone(), shutdown.clone()));
    set.spawn(poller::run(ctx.clone(), shutdown.clone()));
    set.spawn(cancel_drainer::run(ctx.clone(), shutdown.clone()));
    set.spawn(sweeper::run(ctx.clone(), shutdown.clone()));
    set.spawn(private_feed::run_price_feeds(ctx, shutdown));

    set
}

/// Shared ingestion path for L1 and L2: apply the event through the
/// store, then surface terminal fills to the notifier.
pub async fn ingest_event(ctx: &ReconcileCtx, event: &OrderFeedEvent) {
    match orders::upsert_from_feed(&ctx.db, event).await {
        Ok(false) => {}
        Ok(true) => {
            if event.status == OrderStatus::Filled {
                if let Ok(Some(order)) =
                    orders::find_by_exchange_order_id(&ctx.db, &event.exchange_order_id).await
                {
                    if order.status == OrderStatus::Filled {
                        ctx.notifier
                            .notify(NotifyEvent::TradeExecuted {
                                strategy_account_id: order.strategy_account_id,
                                symbol: order.symbol.clone(),
                                side: order.side,
                                order_type: order.order_type,
                                quantity: order.filled_quantity,
                                price: event
                                    .last_fill_price
                                    .or(order.price)
                                    .unwrap_or_default(),
                                pnl: None,
                                market_type: order.market_type,
                            })
                            .await;
                    }
                }
            }
        }
        Err(e) => {
            warn!(
                exchange_order_id = %event.exchange_order_id,
                error = %e,
                "feed event ingestion failed"
            );
        }
    }
}

/// Boot-time price cache warm-up: one bulk call per distinct
/// (venue, market) among the feed targets.
pub async fn warm_price_cache(ctx: &ReconcileCtx) {
    let targets = match crate::store::accounts::feed_targets(&ctx.db).await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "price warm-up skipped: cannot list accounts");
            return;
        }
    };

    let mut seen = std::collections::HashSet::new();
    for (account, market) in targets {
        if !seen.insert((account.exchange, market)) {
            continue;
        }
        let adapter = ctx.adapters.adapter_for(&account);
        match adapter.fetch_prices_bulk(None, market).await {
            Ok(quotes) => {
                let n = quotes.len();
                for quote in quotes {
                    ctx.price_cache
                        .insert(account.exchange, market, &quote.symbol, quote.price);
                }
                info!(exchange = %account.exchange, market = %market, quotes = n, "price cache warmed");
            }
            Err(e) => {
                warn!(exchange = %account.exchange, error = %e, "bulk price warm-up failed");
            }
        }
    }
}

/// Registry load at boot plus the periodic refresh loop.
pub async fn run_registry_refresh(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let period = std::time::Duration::from_secs(ctx.config.registry_refresh_secs.max(60));
    loop {
        refresh_registry_once(&ctx).await;
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {
                info!("registry refresh loop stopping");
                return;
            }
        }
    }
}

pub async fn refresh_registry_once(ctx: &ReconcileCtx) {
    let targets = match crate::store::accounts::feed_targets(&ctx.db).await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "registry refresh skipped");
            return;
        }
    };
    let mut seen = std::collections::HashSet::new();
    for (account, market) in targets {
        if !seen.insert((account.exchange, market)) {
            continue;
        }
        let adapter = ctx.adapters.adapter_for(&account);
        match adapter.fetch_instruments(market).await {
            Ok(metas) => {
                let n = metas.len();
                ctx.registry.upsert_all(account.exchange, metas);
                info!(exchange = %account.exchange, instruments = n, "registry refreshed");
            }
            Err(e) => {
                warn!(exchange = %account.exchange, error = %e, "instrument refresh failed");
            }
        }
    }
}
