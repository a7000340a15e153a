use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::price_cache::PriceCache;
use crate::registry::SymbolRegistry;
use crate::store::Database;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<SymbolRegistry>,
    pub price_cache: Arc<PriceCache>,
}

impl AppState {
    pub fn new(
        db: Database,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<SymbolRegistry>,
        price_cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            registry,
            price_cache,
        }
    }
}
