pub mod bridge;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::websocket::AppState;

/// Assemble the http and websocket surface for the given state.
pub fn build_router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();

    let mut app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(handlers::health_check))
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
