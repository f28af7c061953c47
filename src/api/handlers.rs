use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse, Json, Response},
};
use log::debug;
use serde_json::{Value, json};

use super::{
    error::{ApiError, OrInternal},
    extract::{ApiJson, ApiQuery},
    pages,
    types::*,
};
use crate::{Settings, generator::NetworkInfo, service::GenerationService};

/// Shared server state.
pub struct AppState {
    pub service: Arc<GenerationService>,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

fn png_response(bytes: Vec<u8>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        bytes,
    )
        .into_response()
}

// ============================================================================
// Pages
// ============================================================================

pub async fn home_page() -> Html<&'static str> {
    Html(pages::INDEX_HTML)
}

pub async fn grid_page() -> Html<&'static str> {
    Html(pages::GRID_HTML)
}

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "API is running."}))
}

pub async fn favicon(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let path = state.settings.static_dir.join("favicon.png");
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(_) => Err(ApiError::NotFound("Favicon not found".to_string())),
    }
}

// ============================================================================
// Generation
// ============================================================================

pub async fn generate_single_face(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<GenerateFaceRequest>,
) -> Result<Json<GenerateFaceResponse>, ApiError> {
    validate_truncation(req.truncation)?;
    let result = state
        .service
        .generate_single_image(req.seed, req.truncation, req.enhance_face, true)
        .await
        .or_internal("Single image generation")?;
    Ok(Json(result.into()))
}

pub async fn generate_face_grid(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<GenerateGridRequest>,
) -> Result<Json<GenerateGridResponse>, ApiError> {
    let num_ws = state.service.model_info().synthesis_layers;
    req.validate(state.settings.max_grid_tiles, num_ws)?;

    let result = state
        .service
        .generate_grid_image(
            req.row_seeds,
            req.col_seeds,
            req.col_styles,
            req.truncation,
            req.enhance_face,
            true,
        )
        .await
        .or_internal("Style mixing generation")?;

    let mut response = GenerateGridResponse::from(result);
    // Grid files are new on every request; defeat browser caching.
    if let Some(url) = response.url.as_mut() {
        url.push_str(&format!("?t={}", chrono::Utc::now().timestamp()));
    }
    Ok(Json(response))
}

pub async fn generate_single_face_direct(
    State(state): State<SharedState>,
    ApiQuery(query): ApiQuery<DirectQuery>,
) -> Result<Response, ApiError> {
    validate_truncation(query.truncation)?;
    let bytes = state
        .service
        .generate_direct_image(query.seed, query.truncation, true, query.persist)
        .await
        .or_internal("Direct generation")?;
    Ok(png_response(bytes, &format!("{}.png", query.seed)))
}

pub async fn download_cached_single_face(
    State(state): State<SharedState>,
    ApiQuery(query): ApiQuery<DownloadQuery>,
) -> Result<Response, ApiError> {
    let path = state
        .service
        .cached_or_generate(query.seed)
        .await
        .or_internal("Download")?;
    debug!("Serving {}", path.display());
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(anyhow::Error::from)
        .or_internal("Download")?;
    Ok(png_response(bytes, &format!("face_{}.png", query.seed)))
}

pub async fn model_info(State(state): State<SharedState>) -> Json<NetworkInfo> {
    Json(state.service.model_info())
}
