//! Notifier sink (thin interface).
//!
//! The router emits typed events to an external sink and consumes no
//! feedback. The default sink writes structured log lines; deployments
//! plug a real transport in behind the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core_types::{MarketType, OrderType, Side, StrategyAccountId};

/// Events the core publishes.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    TradeExecuted {
        strategy_account_id: StrategyAccountId,
        symbol: String,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Decimal,
        pnl: Option<Decimal>,
        market_type: MarketType,
    },
    DailyReport {
        date: DateTime<Utc>,
        /// (group_name, realized pnl) per strategy.
        strategy_pnl: Vec<(String, Decimal)>,
    },
    OrderFailed {
        strategy_account_id: StrategyAccountId,
        symbol: String,
        reason: String,
    },
    AccountDisabled {
        account_id: i64,
        reason: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// Default sink: structured tracing events.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: NotifyEvent) {
        match event {
            NotifyEvent::TradeExecuted {
                strategy_account_id,
                symbol,
                side,
                quantity,
                price,
                pnl,
                ..
            } => {
                tracing::info!(
                    strategy_account_id,
                    %symbol,
                    %side,
                    %quantity,
                    %price,
                    pnl = pnl.map(|p| p.to_string()),
                    "trade executed"
                );
            }
            NotifyEvent::DailyReport { date, strategy_pnl } => {
                tracing::info!(%date, strategies = strategy_pnl.len(), "daily report");
                for (group, pnl) in strategy_pnl {
                    tracing::info!(%group, %pnl, "daily strategy pnl");
                }
            }
            NotifyEvent::OrderFailed {
                strategy_account_id,
                symbol,
                reason,
            } => {
                tracing::warn!(strategy_account_id, %symbol, %reason, "order failed");
            }
            NotifyEvent::AccountDisabled { account_id, reason } => {
                tracing::error!(account_id, %reason, "account disabled");
            }
        }
    }
}

/// Test sink that records events.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<NotifyEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: NotifyEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
