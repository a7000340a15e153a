//! PostgreSQL schema bootstrap.
//!
//! Executed at startup; every statement is idempotent. Indices carry the
//! concurrency contract: the partial unique on `exchange_order_id`
//! excludes PENDING sentinels, trades dedupe on (exchange_order_id,
//! fill_seq), and the cancel queue allows one inflight row per order.

use sqlx::PgPool;

use crate::error::RouterError;

pub async fn init_schema(pool: &PgPool) -> Result<(), RouterError> {
    tracing::info!("Initializing PostgreSQL schema...");

    for (name, ddl) in STATEMENTS {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| RouterError::Database(format!("{name}: {e}")))?;
    }

    tracing::info!("PostgreSQL schema initialized");
    Ok(())
}

const STATEMENTS: &[(&str, &str)] = &[
    ("accounts_tb", CREATE_ACCOUNTS),
    ("strategies_tb", CREATE_STRATEGIES),
    ("strategy_accounts_tb", CREATE_STRATEGY_ACCOUNTS),
    ("strategy_capital_tb", CREATE_STRATEGY_CAPITAL),
    ("strategy_positions_tb", CREATE_STRATEGY_POSITIONS),
    ("open_orders_tb", CREATE_OPEN_ORDERS),
    ("open_orders_eoid_idx", CREATE_OPEN_ORDERS_EOID_INDEX),
    ("open_orders_nonterminal_idx", CREATE_OPEN_ORDERS_NONTERMINAL_INDEX),
    ("trades_tb", CREATE_TRADES),
    ("failed_orders_tb", CREATE_FAILED_ORDERS),
    ("cancel_queue_tb", CREATE_CANCEL_QUEUE),
    ("cancel_queue_inflight_idx", CREATE_CANCEL_QUEUE_INFLIGHT_INDEX),
    ("webhook_logs_tb", CREATE_WEBHOOK_LOGS),
];

const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts_tb (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    exchange        SMALLINT NOT NULL,
    name            TEXT NOT NULL,
    public_key      TEXT NOT NULL,
    secret_key      TEXT NOT NULL,
    passphrase      TEXT,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    is_testnet      BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_STRATEGIES: &str = r#"
CREATE TABLE IF NOT EXISTS strategies_tb (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    group_name      TEXT NOT NULL UNIQUE,
    market_type     SMALLINT NOT NULL,
    webhook_token   TEXT NOT NULL UNIQUE,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    is_public       BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_STRATEGY_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS strategy_accounts_tb (
    id              BIGSERIAL PRIMARY KEY,
    strategy_id     BIGINT NOT NULL REFERENCES strategies_tb(id),
    account_id      BIGINT NOT NULL REFERENCES accounts_tb(id),
    weight          NUMERIC NOT NULL CHECK (weight > 0),
    leverage        INTEGER NOT NULL DEFAULT 1 CHECK (leverage >= 1),
    max_symbols     INTEGER,
    UNIQUE (strategy_id, account_id)
)
"#;

const CREATE_STRATEGY_CAPITAL: &str = r#"
CREATE TABLE IF NOT EXISTS strategy_capital_tb (
    strategy_account_id BIGINT NOT NULL UNIQUE
                        REFERENCES strategy_accounts_tb(id),
    allocated_capital   NUMERIC NOT NULL DEFAULT 0,
    current_pnl         NUMERIC NOT NULL DEFAULT 0,
    last_updated        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_STRATEGY_POSITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS strategy_positions_tb (
    id                  BIGSERIAL PRIMARY KEY,
    strategy_account_id BIGINT NOT NULL REFERENCES strategy_accounts_tb(id),
    symbol              TEXT NOT NULL,
    quantity            NUMERIC NOT NULL DEFAULT 0,
    entry_price         NUMERIC NOT NULL DEFAULT 0,
    last_updated        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (strategy_account_id, symbol)
)
"#;

const CREATE_OPEN_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS open_orders_tb (
    id                  BIGSERIAL PRIMARY KEY,
    strategy_account_id BIGINT NOT NULL REFERENCES strategy_accounts_tb(id),
    exchange_order_id   TEXT NOT NULL,
    symbol              TEXT NOT NULL,
    side                SMALLINT NOT NULL,
    order_type          SMALLINT NOT NULL,
    price               NUMERIC,
    stop_price          NUMERIC,
    quantity            NUMERIC NOT NULL,
    filled_quantity     NUMERIC NOT NULL DEFAULT 0,
    status              SMALLINT NOT NULL DEFAULT 0,
    market_type         SMALLINT NOT NULL,
    error_message       TEXT,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// PENDING sentinels are excluded so retries can reuse rows while real
/// exchange ids stay globally unique.
const CREATE_OPEN_ORDERS_EOID_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS open_orders_eoid_uq
    ON open_orders_tb (exchange_order_id)
    WHERE exchange_order_id NOT LIKE 'PENDING:%'
"#;

const CREATE_OPEN_ORDERS_NONTERMINAL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS open_orders_nonterminal_idx
    ON open_orders_tb (status, created_at)
    WHERE status NOT IN (40, 50, -10)
"#;

/// One trade row per execution event; WS+poller double delivery collides
/// here.
const CREATE_TRADES: &str = r#"
CREATE TABLE IF NOT EXISTS trades_tb (
    id                  BIGSERIAL PRIMARY KEY,
    strategy_account_id BIGINT NOT NULL REFERENCES strategy_accounts_tb(id),
    exchange_order_id   TEXT NOT NULL,
    fill_seq            BIGINT NOT NULL DEFAULT 0,
    symbol              TEXT NOT NULL,
    side                SMALLINT NOT NULL,
    order_type          SMALLINT NOT NULL,
    order_price         NUMERIC,
    price               NUMERIC NOT NULL,
    quantity            NUMERIC NOT NULL,
    executed_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    pnl                 NUMERIC,
    fee                 NUMERIC,
    is_entry            BOOLEAN NOT NULL,
    market_type         SMALLINT NOT NULL,
    UNIQUE (exchange_order_id, fill_seq)
)
"#;

const CREATE_FAILED_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS failed_orders_tb (
    id                  BIGSERIAL PRIMARY KEY,
    strategy_account_id BIGINT NOT NULL REFERENCES strategy_accounts_tb(id),
    symbol              TEXT NOT NULL,
    side                SMALLINT NOT NULL,
    order_type          SMALLINT NOT NULL,
    quantity            NUMERIC NOT NULL,
    price               NUMERIC,
    stop_price          NUMERIC,
    reason              TEXT NOT NULL,
    exchange_error      TEXT,
    operation_type      SMALLINT NOT NULL,
    original_order_id   BIGINT,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_CANCEL_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS cancel_queue_tb (
    id              BIGSERIAL PRIMARY KEY,
    order_id        BIGINT NOT NULL REFERENCES open_orders_tb(id),
    strategy_id     BIGINT NOT NULL,
    account_id      BIGINT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    status          SMALLINT NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// At most one PENDING/PROCESSING cancel per order.
const CREATE_CANCEL_QUEUE_INFLIGHT_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS cancel_queue_inflight_uq
    ON cancel_queue_tb (order_id)
    WHERE status IN (0, 10)
"#;

const CREATE_WEBHOOK_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_logs_tb (
    id          BIGSERIAL PRIMARY KEY,
    received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    payload     JSONB NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT
)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{CancelStatus, OrderStatus};

    // The status ids baked into the partial indices must match the enum
    // ids; this pins them.
    #[test]
    fn test_partial_index_ids_match_enums() {
        assert!(CREATE_OPEN_ORDERS_NONTERMINAL_INDEX.contains("(40, 50, -10)"));
        assert_eq!(OrderStatus::Filled.id(), 40);
        assert_eq!(OrderStatus::Cancelled.id(), 50);
        assert_eq!(OrderStatus::Failed.id(), -10);

        assert!(CREATE_CANCEL_QUEUE_INFLIGHT_INDEX.contains("(0, 10)"));
        assert_eq!(CancelStatus::Pending.id(), 0);
        assert_eq!(CancelStatus::Processing.id(), 10);
    }

    #[test]
    fn test_sentinel_prefix_matches_index_predicate() {
        assert!(CREATE_OPEN_ORDERS_EOID_INDEX.contains("'PENDING:%'"));
        assert!(crate::core_types::pending_sentinel().starts_with("PENDING:"));
    }
}
