//! Dispatcher: webhook fan-out with isolated per-account failure.
//!
//! A webhook names a strategy group; the dispatcher expands the payload
//! into priority-ordered sub-orders and fans each one out to every
//! subscribed account under a bounded worker pool. One account's failure
//! is recorded (FailedOrder + response summary) and never aborts its
//! siblings. MARKET and CANCEL_ALL_ORDER run inside the HTTP request;
//! LIMIT/STOP are queued to a background worker and acknowledged with
//! 202.

pub mod payload;
pub mod sizer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::config::PipelineConfig;
use crate::core_types::{AccountId, MarketType, OrderStatus, OrderType, PENDING_SENTINEL_PREFIX};
use crate::error::{ExchangeError, RouterError};
use crate::exchange::{self, AccountCtx, Deadlines, Exchange, OrderAck};
use crate::notify::{Notifier, NotifyEvent};
use crate::store::models::{Account, Strategy, Subscription};
use crate::store::orders::NewOrder;
use crate::store::{Database, accounts, cancel_queue, failed_orders, orders};

use payload::{RawWebhook, SubOrder};
use sizer::Sizer;

/// Per-account adapter cache. Credentials come from the account row;
/// every account on the same venue still shares that venue's rate
/// limiter through its own adapter instance.
pub struct AdapterPool {
    http: reqwest::Client,
    deadlines: Deadlines,
    use_mock: bool,
    #[cfg(feature = "mock-exchange")]
    mock: Arc<crate::exchange::mock::MockExchange>,
    cache: DashMap<AccountId, Arc<dyn Exchange>>,
}

impl AdapterPool {
    pub fn new(http: reqwest::Client, deadlines: Deadlines, use_mock: bool) -> Self {
        #[cfg(not(feature = "mock-exchange"))]
        if use_mock {
            panic!("USE_MOCK_EXCHANGE requires the mock-exchange feature");
        }
        Self {
            http,
            deadlines,
            use_mock,
            #[cfg(feature = "mock-exchange")]
            mock: Arc::new(crate::exchange::mock::MockExchange::new()),
            cache: DashMap::new(),
        }
    }

    #[cfg(feature = "mock-exchange")]
    pub fn mock(&self) -> Arc<crate::exchange::mock::MockExchange> {
        self.mock.clone()
    }

    pub fn adapter_for(&self, account: &Account) -> Arc<dyn Exchange> {
        #[cfg(feature = "mock-exchange")]
        if self.use_mock {
            return self.mock.clone();
        }
        let _ = self.use_mock;
        self.cache
            .entry(account.id)
            .or_insert_with(|| {
                exchange::build_adapter(
                    account.exchange,
                    AccountCtx {
                        account_id: account.id,
                        public_key: account.public_key.clone(),
                        secret_key: account.secret_key.clone(),
                        passphrase: account.passphrase.clone(),
                        testnet: account.is_testnet,
                    },
                    self.http.clone(),
                    self.deadlines,
                )
            })
            .clone()
    }
}

/// One account's failure inside a fan-out.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DispatchFailure {
    pub account_id: AccountId,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_error: Option<String>,
}

/// Aggregated fan-out result returned to the webhook caller.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct DispatchSummary {
    pub accepted: usize,
    pub failed: usize,
    pub failures: Vec<DispatchFailure>,
    /// Sub-order dispatches queued to the slow path.
    pub queued: usize,
}

impl DispatchSummary {
    fn absorb(&mut self, other: DispatchSummary) {
        self.accepted += other.accepted;
        self.failed += other.failed;
        self.queued += other.queued;
        self.failures.extend(other.failures);
    }
}

/// A deferred LIMIT/STOP dispatch unit.
struct SlowJob {
    sub_order: SubOrder,
    subscription: Subscription,
    market: MarketType,
}

pub struct Dispatcher {
    db: Database,
    sizer: Sizer,
    adapters: Arc<AdapterPool>,
    notifier: Arc<dyn Notifier>,
    fanout: Arc<Semaphore>,
    slow_tx: mpsc::Sender<SlowJob>,
    /// Process-local idempotency keys with insertion time.
    seen_keys: DashMap<String, Instant>,
    config: PipelineConfig,
}

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);
const SLOW_QUEUE_DEPTH: usize = 1024;

impl Dispatcher {
    pub fn new(
        db: Database,
        sizer: Sizer,
        adapters: Arc<AdapterPool>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (slow_tx, slow_rx) = mpsc::channel(SLOW_QUEUE_DEPTH);
        let dispatcher = Arc::new(Self {
            db,
            sizer,
            adapters,
            notifier,
            fanout: Arc::new(Semaphore::new(config.dispatch_fanout.max(1))),
            slow_tx,
            seen_keys: DashMap::new(),
            config,
        });
        dispatcher.clone().spawn_slow_worker(slow_rx);
        dispatcher
    }

    fn spawn_slow_worker(self: Arc<Self>, mut rx: mpsc::Receiver<SlowJob>) {
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = self
                    .dispatch_one(&job.sub_order, &job.subscription, job.market)
                    .await;
                if let Err(failure) = result {
                    warn!(
                        account_id = failure.account_id,
                        reason = %failure.reason,
                        "slow-path dispatch failed"
                    );
                }
            }
        });
    }

    /// Resolve the strategy and verify the webhook token in constant
    /// time.
    pub async fn authorize(&self, group: &str, token: &str) -> Result<Strategy, RouterError> {
        let strategy = accounts::strategy_by_group(&self.db, group)
            .await?
            .ok_or_else(|| RouterError::UnknownGroup(group.to_string()))?;
        if !constant_time_eq(strategy.webhook_token.as_bytes(), token.as_bytes()) {
            return Err(RouterError::TokenRejected);
        }
        if !strategy.is_active {
            return Err(RouterError::StrategyInactive);
        }
        Ok(strategy)
    }

    /// Full webhook handling: authorize, expand, fan out. Response-code
    /// semantics (200 vs 202) live in the gateway; this returns the
    /// summary either way.
    pub async fn handle(&self, raw: &RawWebhook) -> Result<DispatchSummary, RouterError> {
        if let Some(key) = &raw.idempotency_key {
            self.check_idempotency(key)?;
        }

        let strategy = self.authorize(&raw.group_name, &raw.token).await?;
        let sub_orders = payload::expand(raw)?;
        let subscriptions = accounts::subscriptions_for(&self.db, strategy.id).await?;
        if subscriptions.is_empty() {
            info!(group = %strategy.group_name, "no active subscriptions");
            return Ok(DispatchSummary::default());
        }

        let mut summary = DispatchSummary::default();
        // Sub-orders run strictly in priority order; accounts fan out
        // concurrently inside each sub-order.
        for sub_order in &sub_orders {
            if sub_order.order_type.is_fast_path() {
                summary.absorb(
                    self.fan_out(sub_order, &subscriptions, strategy.market_type)
                        .await,
                );
            } else {
                summary.queued += self.enqueue_slow(sub_order, &subscriptions, strategy.market_type).await;
            }
        }
        Ok(summary)
    }

    fn check_idempotency(&self, key: &str) -> Result<(), RouterError> {
        self.seen_keys
            .retain(|_, at| at.elapsed() < IDEMPOTENCY_TTL);
        if self.seen_keys.contains_key(key) {
            return Err(RouterError::DuplicateRequest(key.to_string()));
        }
        self.seen_keys.insert(key.to_string(), Instant::now());
        Ok(())
    }

    /// Concurrent fan-out of one sub-order across all subscriptions,
    /// bounded by the dispatch semaphore. Worker panics are contained
    /// and reported as that account's failure.
    async fn fan_out(
        &self,
        sub_order: &SubOrder,
        subscriptions: &[Subscription],
        market: MarketType,
    ) -> DispatchSummary {
        let mut set: JoinSet<Result<(), DispatchFailure>> = JoinSet::new();

        for subscription in subscriptions {
            let permit = self
                .fanout
                .clone()
                .acquire_owned()
                .await
                .expect("fanout semaphore closed");
            let sub_order = sub_order.clone();
            let subscription = subscription.clone();
            let this = self.clone_refs();
            set.spawn(async move {
                let _permit = permit;
                this.dispatch_one(&sub_order, &subscription, market).await
            });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => summary.accepted += 1,
                Ok(Err(failure)) => {
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
                Err(join_err) => {
                    error!(error = %join_err, "dispatch worker panicked");
                    summary.failed += 1;
                    summary.failures.push(DispatchFailure {
                        account_id: 0,
                        reason: format!("worker panic: {join_err}"),
                        exchange_error: None,
                    });
                }
            }
        }
        summary
    }

    async fn enqueue_slow(
        &self,
        sub_order: &SubOrder,
        subscriptions: &[Subscription],
        market: MarketType,
    ) -> usize {
        let mut queued = 0;
        for subscription in subscriptions {
            let job = SlowJob {
                sub_order: sub_order.clone(),
                subscription: subscription.clone(),
                market,
            };
            if self.slow_tx.send(job).await.is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Everything `dispatch_one` needs, cloneable into worker tasks.
    fn clone_refs(&self) -> DispatchCtx {
        DispatchCtx {
            db: self.db.clone(),
            registry: self.sizer.registry.clone(),
            price_cache: self.sizer.price_cache.clone(),
            adapters: self.adapters.clone(),
            notifier: self.notifier.clone(),
            fast_deadline: Duration::from_secs(self.config.market_order_timeout_secs),
            slow_deadline: Duration::from_secs(self.config.rest_timeout_secs),
        }
    }

    async fn dispatch_one(
        &self,
        sub_order: &SubOrder,
        subscription: &Subscription,
        market: MarketType,
    ) -> Result<(), DispatchFailure> {
        self.clone_refs()
            .dispatch_one(sub_order, subscription, market)
            .await
    }
}

/// Worker-side dispatch context.
#[derive(Clone)]
struct DispatchCtx {
    db: Database,
    registry: Arc<crate::registry::SymbolRegistry>,
    price_cache: Arc<crate::price_cache::PriceCache>,
    adapters: Arc<AdapterPool>,
    notifier: Arc<dyn Notifier>,
    fast_deadline: Duration,
    slow_deadline: Duration,
}

impl DispatchCtx {
    /// One (sub-order, account) unit, isolated: any failure is recorded
    /// and returned, never propagated.
    async fn dispatch_one(
        &self,
        sub_order: &SubOrder,
        subscription: &Subscription,
        market: MarketType,
    ) -> Result<(), DispatchFailure> {
        let account_id = subscription.account.id;
        let result = self.dispatch_inner(sub_order, subscription, market).await;
        match result {
            Ok(()) => Ok(()),
            Err((reason, exchange_error)) => {
                self.notifier
                    .notify(NotifyEvent::OrderFailed {
                        strategy_account_id: subscription.strategy_account_id,
                        symbol: sub_order.symbol.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                Err(DispatchFailure {
                    account_id,
                    reason,
                    exchange_error,
                })
            }
        }
    }

    async fn dispatch_inner(
        &self,
        sub_order: &SubOrder,
        subscription: &Subscription,
        market: MarketType,
    ) -> Result<(), (String, Option<String>)> {
        let adapter = self.adapters.adapter_for(&subscription.account);

        if sub_order.order_type == OrderType::CancelAllOrder {
            return self
                .cancel_all(sub_order, subscription)
                .await
                .map_err(|e| (e.to_string(), None));
        }

        let sizer = Sizer {
            registry: self.registry.clone(),
            price_cache: self.price_cache.clone(),
        };
        let mut sized = match sizer
            .size(&self.db, adapter.as_ref(), sub_order, subscription, market)
            .await
        {
            Ok(sized) => sized,
            Err(e) => {
                // Sizing rejections still leave an operator record.
                let _ = failed_orders::insert(
                    &self.db,
                    &failed_orders::FailedOrderEntry {
                        strategy_account_id: subscription.strategy_account_id,
                        symbol: sub_order.symbol.clone(),
                        side: sub_order.side.unwrap_or(crate::core_types::Side::Buy),
                        order_type: sub_order.order_type,
                        quantity: rust_decimal::Decimal::ZERO,
                        price: sub_order.price,
                        stop_price: sub_order.stop_price,
                        reason: e.code().to_string(),
                        exchange_error: None,
                        operation_type: crate::core_types::OperationType::Create,
                        original_order_id: None,
                    },
                )
                .await;
                return Err((e.to_string(), None));
            }
        };

        // Futures: push the clamped leverage before the order.
        if market == MarketType::Futures && adapter.capabilities().supports_leverage {
            let max = self
                .registry
                .get(subscription.account.exchange, &sub_order.symbol)
                .map(|m| m.max_leverage)
                .unwrap_or(subscription.leverage);
            let clamped = subscription.leverage.min(max.max(1));
            if let Err(e) = adapter.set_leverage(&sub_order.symbol, clamped).await {
                warn!(error = %e, symbol = %sub_order.symbol, "set_leverage failed");
            }
        }

        // DB-first: the PENDING row exists before the wire call, and its
        // sentinel uuid rides along as the client order id so a timeout
        // can be resolved by probe.
        let pending = orders::create_pending_order(
            &self.db,
            &NewOrder {
                strategy_account_id: subscription.strategy_account_id,
                symbol: sub_order.symbol.clone(),
                side: sized.request.side,
                order_type: sub_order.order_type,
                price: sized.request.price,
                stop_price: sized.request.stop_price,
                quantity: sized.request.qty,
                market_type: market,
            },
        )
        .await
        .map_err(|e| (e.to_string(), None))?;

        sized.request.client_order_id = Some(
            pending
                .exchange_order_id
                .trim_start_matches(PENDING_SENTINEL_PREFIX)
                .to_string(),
        );

        let deadline = if sub_order.order_type.is_fast_path() {
            self.fast_deadline
        } else {
            self.slow_deadline
        };

        let created = tokio::time::timeout(deadline, adapter.create_order(&sized.request)).await;
        let ack = match created {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                return self
                    .handle_create_error(&sized, pending.id, subscription, adapter.as_ref(), e)
                    .await;
            }
            Err(_elapsed) => {
                return self
                    .handle_create_error(
                        &sized,
                        pending.id,
                        subscription,
                        adapter.as_ref(),
                        ExchangeError::TransientNetwork("create deadline elapsed".into()),
                    )
                    .await;
            }
        };

        let promoted = orders::promote_pending(&self.db, pending.id, &ack)
            .await
            .map_err(|e| (e.to_string(), None))?;

        if promoted.status == OrderStatus::Filled {
            self.notifier
                .notify(NotifyEvent::TradeExecuted {
                    strategy_account_id: subscription.strategy_account_id,
                    symbol: promoted.symbol.clone(),
                    side: promoted.side,
                    order_type: promoted.order_type,
                    quantity: promoted.filled_quantity,
                    price: ack.avg_price.or(sized.last_price).unwrap_or_default(),
                    pnl: None,
                    market_type: market,
                })
                .await;
        }
        Ok(())
    }

    /// CANCEL_ALL_ORDER: enqueue one cancel per matching open order; the
    /// drainer (L3) talks to the venue.
    async fn cancel_all(
        &self,
        sub_order: &SubOrder,
        subscription: &Subscription,
    ) -> Result<(), RouterError> {
        let targets = orders::cancellable(
            &self.db,
            subscription.strategy_account_id,
            &sub_order.symbol,
            sub_order.side,
        )
        .await?;
        for order in targets {
            let queued = cancel_queue::enqueue(
                &self.db,
                order.id,
                subscription.strategy_id,
                subscription.account.id,
            )
            .await?;
            if !queued {
                info!(order_id = order.id, "cancel already inflight, skipped");
            }
        }
        Ok(())
    }

    /// Create-path error handling per the §7 taxonomy.
    async fn handle_create_error(
        &self,
        sized: &sizer::SizedOrder,
        pending_id: i64,
        subscription: &Subscription,
        adapter: &dyn Exchange,
        err: ExchangeError,
    ) -> Result<(), (String, Option<String>)> {
        let exchange_error = Some(err.to_string());
        match &err {
            // State unknown: probe by client id, never blind-retry.
            ExchangeError::TransientNetwork(_) => {
                let probe = match &sized.request.client_order_id {
                    Some(cid) => adapter
                        .fetch_order_by_client_id(cid, &sized.request.symbol, sized.request.market)
                        .await
                        .unwrap_or(None),
                    None => None,
                };
                match probe {
                    Some(snap) => {
                        let ack = OrderAck {
                            exchange_order_id: snap.exchange_order_id,
                            status: snap.status,
                            filled_qty: snap.filled_qty,
                            avg_price: snap.avg_price,
                        };
                        orders::promote_pending(&self.db, pending_id, &ack)
                            .await
                            .map_err(|e| (e.to_string(), None))?;
                        info!(pending_id, "create timeout resolved by probe");
                        return Ok(());
                    }
                    None => {
                        orders::fail_pending(
                            &self.db,
                            pending_id,
                            "create-unconfirmed",
                            exchange_error.clone(),
                        )
                        .await
                        .map_err(|e| (e.to_string(), None))?;
                        return Err(("create-unconfirmed".into(), exchange_error));
                    }
                }
            }
            ExchangeError::AuthError(_) => {
                let _ = accounts::disable_account(&self.db, subscription.account.id).await;
                self.notifier
                    .notify(NotifyEvent::AccountDisabled {
                        account_id: subscription.account.id,
                        reason: err.to_string(),
                    })
                    .await;
            }
            _ => {}
        }

        let reason = match &err {
            ExchangeError::Throttled(_) => "throttled",
            ExchangeError::Rejected(_) => "rejected",
            ExchangeError::AuthError(_) => "auth-error",
            ExchangeError::NotFound(_) => "not-found",
            ExchangeError::Conflict(_) => "conflict",
            ExchangeError::UnknownTerminal(_) => "unknown-terminal",
            ExchangeError::TransientNetwork(_) => unreachable!("handled above"),
        };
        orders::fail_pending(&self.db, pending_id, reason, exchange_error.clone())
            .await
            .map_err(|e| (e.to_string(), None))?;
        Err((reason.to_string(), exchange_error))
    }
}

/// Constant-time byte comparison for webhook tokens.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(!constant_time_eq(b"secret-token", b"secret-tokeX"));
        assert!(!constant_time_eq(b"short", b"longer-token"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_summary_absorb() {
        let mut a = DispatchSummary {
            accepted: 2,
            failed: 1,
            queued: 0,
            failures: vec![DispatchFailure {
                account_id: 7,
                reason: "rejected".into(),
                exchange_error: None,
            }],
        };
        let b = DispatchSummary {
            accepted: 1,
            failed: 1,
            queued: 3,
            failures: vec![DispatchFailure {
                account_id: 9,
                reason: "throttled".into(),
                exchange_error: Some("429".into()),
            }],
        };
        a.absorb(b);
        assert_eq!(a.accepted, 3);
        assert_eq!(a.failed, 2);
        assert_eq!(a.queued, 3);
        assert_eq!(a.failures.len(), 2);
    }
}
