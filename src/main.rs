//! Router entry point: config, logging, store, reconciler loops, gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use trade_router::config::{AppConfig, DatabaseConfig};
use trade_router::dispatch::sizer::Sizer;
use trade_router::dispatch::{AdapterPool, Dispatcher};
use trade_router::exchange::{Deadlines, build_http_client};
use trade_router::gateway::{self, state::AppState};
use trade_router::notify::{Notifier, TracingNotifier};
use trade_router::price_cache::PriceCache;
use trade_router::reconcile::{self, ReconcileCtx};
use trade_router::registry::SymbolRegistry;
use trade_router::logging;
use trade_router::store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _log_guard = logging::init_logging(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "trade_router starting"
    );
    if config.server.use_mock_exchange {
        tracing::warn!("USE_MOCK_EXCHANGE is on: all venue traffic is simulated");
    }

    let db = Database::connect(&config.database.url, config.database.pool_size).await?;

    let registry = Arc::new(SymbolRegistry::new());
    let price_cache = Arc::new(PriceCache::new(
        Duration::from_secs(config.pipeline.price_ttl_secs),
        Duration::from_secs(config.pipeline.price_stale_secs),
    ));
    let adapters = Arc::new(AdapterPool::new(
        build_http_client(Duration::from_secs(5)),
        Deadlines {
            fast: Duration::from_secs(config.pipeline.market_order_timeout_secs),
            slow: Duration::from_secs(config.pipeline.rest_timeout_secs),
        },
        config.server.use_mock_exchange,
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let dispatcher = Dispatcher::new(
        db.clone(),
        Sizer {
            registry: registry.clone(),
            price_cache: price_cache.clone(),
        },
        adapters.clone(),
        notifier.clone(),
        config.pipeline.clone(),
    );

    let ctx = ReconcileCtx {
        db: db.clone(),
        adapters,
        registry: registry.clone(),
        price_cache: price_cache.clone(),
        notifier,
        config: config.pipeline.clone(),
        rebalance: config.rebalance.clone(),
    };

    // Boot warm-up before traffic: instrument metadata, then prices.
    reconcile::refresh_registry_once(&ctx).await;
    reconcile::warm_price_cache(&ctx).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = reconcile::spawn_all(ctx.clone(), shutdown_rx.clone());
    background.spawn(reconcile::run_registry_refresh(ctx, shutdown_rx.clone()));

    let state = AppState::new(db, dispatcher, registry, price_cache);
    let server = tokio::spawn({
        let bind_addr = config.server.bind_addr.clone();
        async move { gateway::serve(&bind_addr, state, shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = server.await? {
        error!(error = %e, "gateway exited with error");
    }
    while background.join_next().await.is_some() {}
    info!("trade_router stopped");
    Ok(())
}

/// Config file path from argv[1] or CONFIG_PATH; falls back to pure-env
/// configuration (DATABASE_URL required) when no file exists.
fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "config.yaml".to_string());

    if std::path::Path::new(&path).exists() {
        return AppConfig::from_file(&path);
    }

    let url = std::env::var("DATABASE_URL").map_err(|_| {
        anyhow::anyhow!("no config file at {path} and DATABASE_URL is not set")
    })?;
    let mut config = AppConfig {
        server: Default::default(),
        database: DatabaseConfig { url, pool_size: 10 },
        logging: Default::default(),
        pipeline: Default::default(),
        rebalance: Default::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}
