//! HTTP layer: routes request bodies to the generation service.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod pages;
pub mod types;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use log::{info, warn};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    services::ServeDir,
};

pub use error::ApiError;
pub use handlers::{AppState, SharedState};

/// Prefix the UI pages call the API under.
pub const API_PREFIX: &str = "/api/v1/generate";

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {origin:?}");
                None
            }
        })
        .collect();
    // Credentials rule out wildcards, so methods and headers are mirrored.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn generation_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(handlers::home_page))
        .route("/grid", get(handlers::grid_page))
        .route("/single", post(handlers::generate_single_face))
        .route("/style-mix", post(handlers::generate_face_grid))
        .route("/single/direct", get(handlers::generate_single_face_direct))
        .route("/single/download", get(handlers::download_cached_single_face))
        .route("/info", get(handlers::model_info))
}

pub fn router(state: SharedState) -> Router {
    let static_dir = state.settings.static_dir.clone();
    let cors = cors_layer(&state.settings.allowed_origins);
    Router::new()
        .route("/", get(handlers::home_page))
        .route("/grid", get(handlers::grid_page))
        .route("/health", get(handlers::health_check))
        .route("/favicon.ico", get(handlers::favicon))
        .nest(API_PREFIX, generation_routes())
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: SharedState) -> Result<()> {
    let bind_address = state.settings.bind_address();
    let app = router(state);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await.context("Server error")
}
