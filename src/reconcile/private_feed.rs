//! L1: private WebSocket feed ingestion, plus the public price feeds.
//!
//! One authenticated subscription per active (account, market). The
//! adapter owns reconnection; this layer owns the subscription set,
//! re-reading it periodically so accounts added or disabled at runtime
//! are picked up without a restart.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core_types::{AccountId, MarketType};
use crate::store::{accounts, orders, positions};

use super::{ReconcileCtx, ingest_event};

/// How often the subscription set is reconciled with the database.
const RESUBSCRIBE_PERIOD: Duration = Duration::from_secs(60);
const FEED_BUFFER: usize = 1024;

pub async fn run(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let mut tasks: HashMap<(AccountId, MarketType), JoinHandle<()>> = HashMap::new();
    info!("private feed manager started");

    loop {
        match accounts::feed_targets(&ctx.db).await {
            Ok(targets) => {
                let wanted: HashSet<(AccountId, MarketType)> = targets
                    .iter()
                    .map(|(account, market)| (account.id, *market))
                    .collect();

                // Drop feeds for disabled accounts
                tasks.retain(|key, handle| {
                    if wanted.contains(key) && !handle.is_finished() {
                        true
                    } else {
                        handle.abort();
                        debug!(?key, "private feed dropped");
                        false
                    }
                });

                // Start feeds for new targets
                for (account, market) in targets {
                    let key = (account.id, market);
                    if tasks.contains_key(&key) {
                        continue;
                    }
                    let adapter = ctx.adapters.adapter_for(&account);
                    if !adapter.capabilities().supports_private_ws {
                        continue;
                    }
                    let (tx, mut rx) = mpsc::channel(FEED_BUFFER);
                    let consumer_ctx = ctx.clone();
                    let consumer = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            ingest_event(&consumer_ctx, &event).await;
                        }
                    });
                    let producer = tokio::spawn(async move {
                        adapter.ws_subscribe_private_orders(market, tx).await;
                        consumer.abort();
                    });
                    info!(account_id = account.id, market = %market, "private feed subscribed");
                    tasks.insert(key, producer);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "feed target refresh failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RESUBSCRIBE_PERIOD) => {}
            _ = shutdown.changed() => {
                for (_, handle) in tasks.drain() {
                    handle.abort();
                }
                info!("private feed manager stopping");
                return;
            }
        }
    }
}

/// Public price feeds: one subscription per (venue, market), covering
/// the symbols with open interest (non-terminal orders or non-flat
/// positions). The set is rebuilt periodically; a changed set restarts
/// that venue's subscription.
pub async fn run_price_feeds(ctx: ReconcileCtx, mut shutdown: watch::Receiver<bool>) {
    let mut feeds: HashMap<(crate::core_types::ExchangeId, MarketType), (Vec<String>, JoinHandle<()>)> =
        HashMap::new();
    info!("public price feed manager started");

    loop {
        if let Ok(wanted) = wanted_symbols(&ctx).await {
            // Drop feeds whose symbol set changed or venue disappeared
            feeds.retain(|key, (symbols, handle)| {
                match wanted.get(key) {
                    Some(current) if current == symbols && !handle.is_finished() => true,
                    _ => {
                        handle.abort();
                        false
                    }
                }
            });

            for (key, symbols) in wanted {
                if symbols.is_empty() || feeds.contains_key(&key) {
                    continue;
                }
                let Some(adapter) = adapter_for_venue(&ctx, key.0).await else {
                    continue;
                };
                let (tx, mut rx) = mpsc::channel::<crate::exchange::Quote>(FEED_BUFFER);
                let cache = ctx.price_cache.clone();
                let (exchange, market) = key;
                let consumer = tokio::spawn(async move {
                    while let Some(quote) = rx.recv().await {
                        cache.insert(exchange, market, &quote.symbol, quote.price);
                    }
                });
                let syms = symbols.clone();
                let producer = tokio::spawn(async move {
                    adapter.ws_subscribe_public_prices(syms, market, tx).await;
                    consumer.abort();
                });
                debug!(exchange = %exchange, market = %market, symbols = symbols.len(), "price feed subscribed");
                feeds.insert(key, (symbols, producer));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RESUBSCRIBE_PERIOD) => {}
            _ = shutdown.changed() => {
                for (_, (_, handle)) in feeds.drain() {
                    handle.abort();
                }
                info!("public price feed manager stopping");
                return;
            }
        }
    }
}

/// Symbols with open interest per (venue, market), sorted for stable
/// set comparison.
async fn wanted_symbols(
    ctx: &ReconcileCtx,
) -> Result<HashMap<(crate::core_types::ExchangeId, MarketType), Vec<String>>, crate::error::RouterError>
{
    let mut out: HashMap<_, HashSet<String>> = HashMap::new();

    let subs = accounts::all_active_subscriptions(&ctx.db).await?;
    let open = orders::non_terminal(&ctx.db).await?;
    for subscription in &subs {
        let venue = subscription.account.exchange;
        for order in open
            .iter()
            .filter(|o| o.strategy_account_id == subscription.strategy_account_id)
        {
            out.entry((venue, order.market_type))
                .or_default()
                .insert(order.symbol.clone());
        }
        for position in positions::positions_for(&ctx.db, subscription.strategy_account_id).await? {
            // Position market segment is not stored; spot covers the
            // display need and futures venues alias the same symbol.
            out.entry((venue, MarketType::Spot))
                .or_default()
                .insert(position.symbol.clone());
        }
    }

    Ok(out
        .into_iter()
        .map(|(key, set)| {
            let mut symbols: Vec<String> = set.into_iter().collect();
            symbols.sort();
            (key, symbols)
        })
        .collect())
}

/// Any active account on the venue provides the (public-data) adapter.
async fn adapter_for_venue(
    ctx: &ReconcileCtx,
    venue: crate::core_types::ExchangeId,
) -> Option<std::sync::Arc<dyn crate::exchange::Exchange>> {
    let subs = accounts::all_active_subscriptions(&ctx.db).await.ok()?;
    subs.iter()
        .find(|s| s.account.exchange == venue)
        .map(|s| ctx.adapters.adapter_for(&s.account))
}
