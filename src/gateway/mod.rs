//! HTTP gateway: webhook ingress, health, Swagger UI.

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::post_webhook, handlers::health),
    components(schemas(
        crate::dispatch::payload::RawWebhook,
        crate::dispatch::payload::RawSubOrder,
        crate::dispatch::DispatchSummary,
        crate::dispatch::DispatchFailure,
        crate::core_types::Side,
        crate::core_types::OrderType,
        types::WebhookResponse,
        types::ErrorBody,
        types::HealthResponse,
    )),
    info(
        title = "trade_router",
        description = "Multi-account, multi-exchange webhook trading router"
    )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handlers::post_webhook))
        .route("/health", get(handlers::health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

/// Serve until the shutdown signal flips.
pub async fn serve(
    bind_addr: &str,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "gateway listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("gateway shutting down");
        })
        .await?;
    Ok(())
}
