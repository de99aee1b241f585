//! API Routes Module
//!
//! Route table and middleware for the HTTP surface.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Builds the application router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/cache", post(handlers::set_entry))
        .route(
            "/cache/:key",
            get(handlers::get_entry).delete(handlers::delete_entry),
        )
        .route("/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
