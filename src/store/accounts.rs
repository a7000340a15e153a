//! Strategy, account, subscription, and capital queries.

use rust_decimal::Decimal;
use sqlx::Row;

use crate::core_types::{AccountId, StrategyAccountId, StrategyId};
use crate::error::RouterError;

use super::Database;
use super::models::{Account, Strategy, StrategyCapital, Subscription};

pub async fn strategy_by_group(
    db: &Database,
    group_name: &str,
) -> Result<Option<Strategy>, RouterError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, group_name, market_type, webhook_token, is_active, is_public
        FROM strategies_tb
        WHERE group_name = $1
        "#,
    )
    .bind(group_name)
    .fetch_optional(db.pool())
    .await?;
    row.map(|r| Strategy::from_row(&r)).transpose()
}

/// Subscription edges of a strategy, restricted to active accounts.
pub async fn subscriptions_for(
    db: &Database,
    strategy_id: StrategyId,
) -> Result<Vec<Subscription>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT sa.id AS sa_id, sa.strategy_id, sa.weight, sa.leverage, sa.max_symbols,
               a.id, a.user_id, a.exchange, a.name, a.public_key, a.secret_key,
               a.passphrase, a.is_active, a.is_testnet
        FROM strategy_accounts_tb sa
        JOIN accounts_tb a ON a.id = sa.account_id
        WHERE sa.strategy_id = $1 AND a.is_active
        ORDER BY sa.id
        "#,
    )
    .bind(strategy_id)
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let leverage: i32 = row.get("leverage");
            Ok(Subscription {
                strategy_account_id: row.get("sa_id"),
                strategy_id: row.get("strategy_id"),
                weight: row.get("weight"),
                leverage: leverage.max(1) as u32,
                max_symbols: row.get("max_symbols"),
                account: Account::from_row(row)?,
            })
        })
        .collect()
}

/// One subscription by id (cancel drainer resolves credentials this way).
pub async fn subscription(
    db: &Database,
    strategy_account_id: StrategyAccountId,
) -> Result<Option<Subscription>, RouterError> {
    let row = sqlx::query(
        r#"
        SELECT sa.id AS sa_id, sa.strategy_id, sa.weight, sa.leverage, sa.max_symbols,
               a.id, a.user_id, a.exchange, a.name, a.public_key, a.secret_key,
               a.passphrase, a.is_active, a.is_testnet
        FROM strategy_accounts_tb sa
        JOIN accounts_tb a ON a.id = sa.account_id
        WHERE sa.id = $1
        "#,
    )
    .bind(strategy_account_id)
    .fetch_optional(db.pool())
    .await?;

    row.map(|row| {
        let leverage: i32 = row.get("leverage");
        Ok(Subscription {
            strategy_account_id: row.get("sa_id"),
            strategy_id: row.get("strategy_id"),
            weight: row.get("weight"),
            leverage: leverage.max(1) as u32,
            max_symbols: row.get("max_symbols"),
            account: Account::from_row(&row)?,
        })
    })
    .transpose()
}

/// Every subscription whose account is active (reconciler feed targets).
pub async fn all_active_subscriptions(db: &Database) -> Result<Vec<Subscription>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT sa.id AS sa_id, sa.strategy_id, sa.weight, sa.leverage, sa.max_symbols,
               a.id, a.user_id, a.exchange, a.name, a.public_key, a.secret_key,
               a.passphrase, a.is_active, a.is_testnet
        FROM strategy_accounts_tb sa
        JOIN accounts_tb a ON a.id = sa.account_id
        WHERE a.is_active
        ORDER BY sa.id
        "#,
    )
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let leverage: i32 = row.get("leverage");
            Ok(Subscription {
                strategy_account_id: row.get("sa_id"),
                strategy_id: row.get("strategy_id"),
                weight: row.get("weight"),
                leverage: leverage.max(1) as u32,
                max_symbols: row.get("max_symbols"),
                account: Account::from_row(row)?,
            })
        })
        .collect()
}

/// Distinct (account, market) pairs that need a private feed, derived
/// from the markets of the strategies each account subscribes to.
pub async fn feed_targets(
    db: &Database,
) -> Result<Vec<(Account, crate::core_types::MarketType)>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT ON (a.id, s.market_type)
               a.id, a.user_id, a.exchange, a.name, a.public_key, a.secret_key,
               a.passphrase, a.is_active, a.is_testnet, s.market_type
        FROM strategy_accounts_tb sa
        JOIN accounts_tb a ON a.id = sa.account_id
        JOIN strategies_tb s ON s.id = sa.strategy_id
        WHERE a.is_active AND s.is_active
        ORDER BY a.id, s.market_type
        "#,
    )
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let market_id: i16 = row.get("market_type");
            let market = crate::core_types::MarketType::from_id(market_id)
                .ok_or_else(|| RouterError::Database(format!("corrupt market_type {market_id}")))?;
            Ok((Account::from_row(row)?, market))
        })
        .collect()
}

/// Realized PnL per strategy group (daily report).
pub async fn strategy_pnl_summary(db: &Database) -> Result<Vec<(String, Decimal)>, RouterError> {
    let rows = sqlx::query(
        r#"
        SELECT s.group_name, COALESCE(SUM(c.current_pnl), 0) AS pnl
        FROM strategies_tb s
        JOIN strategy_accounts_tb sa ON sa.strategy_id = s.id
        JOIN strategy_capital_tb c ON c.strategy_account_id = sa.id
        GROUP BY s.group_name
        ORDER BY s.group_name
        "#,
    )
    .fetch_all(db.pool())
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("group_name"), row.get("pnl")))
        .collect())
}

pub async fn capital_for(
    db: &Database,
    strategy_account_id: StrategyAccountId,
) -> Result<Option<StrategyCapital>, RouterError> {
    let row = sqlx::query(
        r#"
        SELECT strategy_account_id, allocated_capital, current_pnl, last_updated
        FROM strategy_capital_tb
        WHERE strategy_account_id = $1
        "#,
    )
    .bind(strategy_account_id)
    .fetch_optional(db.pool())
    .await?;
    row.map(|r| StrategyCapital::from_row(&r)).transpose()
}

pub async fn set_allocated_capital(
    db: &Database,
    strategy_account_id: StrategyAccountId,
    allocated: Decimal,
) -> Result<(), RouterError> {
    sqlx::query(
        r#"
        INSERT INTO strategy_capital_tb (strategy_account_id, allocated_capital)
        VALUES ($1, $2)
        ON CONFLICT (strategy_account_id)
        DO UPDATE SET allocated_capital = $2, last_updated = NOW()
        "#,
    )
    .bind(strategy_account_id)
    .bind(allocated)
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Disable an account after an AuthError; stays off until an operator
/// intervenes.
pub async fn disable_account(db: &Database, account_id: AccountId) -> Result<(), RouterError> {
    sqlx::query("UPDATE accounts_tb SET is_active = FALSE WHERE id = $1")
        .bind(account_id)
        .execute(db.pool())
        .await?;
    tracing::warn!(account_id, "account disabled until operator intervention");
    Ok(())
}

/// Fixtures for the DB-backed integration tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::core_types::{ExchangeId, MarketType};

    /// Seed one user/strategy/account/subscription chain and return the
    /// strategy_account id. Group and token are randomized per call so
    /// tests do not collide.
    pub async fn seed_subscription(db: &Database) -> StrategyAccountId {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let strategy_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO strategies_tb (user_id, group_name, market_type, webhook_token)
            VALUES (1, $1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(format!("g-{tag}"))
        .bind(MarketType::Spot.id())
        .bind(format!("tok-{tag}"))
        .fetch_one(db.pool())
        .await
        .expect("seed strategy");

        let account_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO accounts_tb (user_id, exchange, name, public_key, secret_key)
            VALUES (1, $1, $2, 'pk', 'sk')
            RETURNING id
            "#,
        )
        .bind(ExchangeId::Binance.id())
        .bind(format!("acct-{tag}"))
        .fetch_one(db.pool())
        .await
        .expect("seed account");

        let sa_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO strategy_accounts_tb (strategy_id, account_id, weight, leverage)
            VALUES ($1, $2, 1.0, 1)
            RETURNING id
            "#,
        )
        .bind(strategy_id)
        .bind(account_id)
        .fetch_one(db.pool())
        .await
        .expect("seed subscription");

        set_allocated_capital(db, sa_id, Decimal::from(1000))
            .await
            .expect("seed capital");
        sa_id
    }
}
