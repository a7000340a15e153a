//! trade_router - Multi-account, multi-exchange webhook trading router
//!
//! External signals name a strategy group; the router fans each signal
//! out to every subscribed exchange account, sizes per-subscription
//! orders, dispatches them concurrently, and reconciles fills through
//! private WebSockets with a REST poller fallback.
//!
//! # Modules
//!
//! - [`core_types`] - Shared enums and ids (OrderStatus, ExchangeId, ...)
//! - [`config`] - YAML + env configuration
//! - [`error`] - Exchange failure taxonomy and router errors
//! - [`symbols`] - Canonical `BASE/QUOTE` symbol normalization
//! - [`registry`] - Per-venue instrument precision rules
//! - [`price_cache`] - TTL last-trade price cache
//! - [`exchange`] - Venue adapters (REST + WS) behind one trait
//! - [`store`] - PostgreSQL order store and state machine
//! - [`dispatch`] - Webhook fan-out, sizing, slow-path queue
//! - [`reconcile`] - Background loops L1-L4
//! - [`gateway`] - HTTP ingress (axum)
//! - [`notify`] - Typed event sink

pub mod config;
pub mod core_types;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod price_cache;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod symbols;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{ExchangeId, MarketType, OrderStatus, OrderType, Side};
pub use dispatch::{AdapterPool, Dispatcher, DispatchSummary};
pub use error::{ExchangeError, RouterError};
pub use exchange::{Exchange, OrderAck, OrderFeedEvent, OrderRequest};
pub use price_cache::PriceCache;
pub use registry::SymbolRegistry;
pub use store::Database;
