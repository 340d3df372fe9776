//! Control API server.

mod handlers;

use crate::config::ServerConfig;
use crate::session::SessionManager;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub manager: Arc<SessionManager>,
}

/// Web server for TrackerSHV.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, manager: Arc<SessionManager>) -> Self {
        Self {
            state: AppState { config, manager },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until ctrl-c.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Control API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Transmission control
        .route("/api/transmission", post(handlers::handle_start_transmission))
        .route("/api/transmission", delete(handlers::handle_stop_transmission))
        .route("/api/sessions/{id}", delete(handlers::handle_stop_session))
        .route("/api/sessions/{id}/packets", post(handlers::handle_send_packet))
        .route("/api/status", get(handlers::handle_get_status))
        // Live device state
        .route("/api/device", get(handlers::handle_get_device))
        .route("/api/device", put(handlers::handle_update_device))
        .route("/api/position", put(handlers::handle_update_position))
        .route("/api/packets/preview", post(handlers::handle_preview_packets))
        // Transmission log
        .route("/api/records", get(handlers::handle_get_records))
        .route("/api/records", delete(handlers::handle_clear_records))
        .route("/api/records/stats", get(handlers::handle_record_stats))
        .route("/api/records/export", get(handlers::handle_export_records))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
