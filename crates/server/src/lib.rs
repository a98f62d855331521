//! Thin HTTP surface over the export engine.
//!
//! Three routes: `POST /` runs an export, `GET /health` reports pool
//! and cache state, `POST /change_hc_version/{version}` swaps the
//! charting library behind an admin token.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use log::info;

use export_core::config::RunMode;
use export_engine::Exporter;

pub mod body;
pub mod cli;
pub mod handlers;

/// Shared state behind every handler.
pub struct AppState {
    pub exporter: Exporter,
    pub server_version: &'static str,
}

impl AppState {
    #[must_use]
    pub fn new(exporter: Exporter) -> Self {
        Self {
            exporter,
            server_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub(crate) fn run_mode(&self) -> RunMode {
        self.exporter.config().export.run_mode
    }
}

/// Assemble the service router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handlers::export))
        .route("/health", get(handlers::health))
        .route(
            "/change_hc_version/{version}",
            post(handlers::change_version),
        )
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let config = &state.exporter.config().server;
    let address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("listening on {address}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
