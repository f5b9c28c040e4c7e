//! Route modules for the Bookvault server

pub mod content;
pub mod health;
pub mod upload;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .merge(health::router())
        .nest("/api/v1/uploads", upload::router())
        .nest("/api/v1/content", content::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
