//! Preview HTTP API.
//!
//! - GET /v1/themes/{theme}/preview?limit&colors&commander
//! - GET /v1/cache/stats
//! - POST /v1/cache/clear
//! - POST /v1/catalog/reload
//! - GET /metrics
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::entry::CacheKey;
use crate::cache::metrics::CacheSnapshot;
use crate::cache::service::{LookupSource, PreviewCache};
use crate::catalog::{Catalog, PreviewItem, SharedCatalog, ThemePreview};
use crate::config::Config;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<PreviewCache<ThemePreview>>,
    pub catalog: SharedCatalog,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/themes/{theme}/preview", get(theme_preview))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/clear", post(clear_cache))
        .route("/v1/catalog/reload", post(reload_catalog))
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PreviewQuery {
    pub limit: Option<usize>,
    pub colors: Option<String>,
    pub commander: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub request_id: String,
    pub theme: String,
    pub limit: usize,
    pub items: Vec<PreviewItem>,
    pub catalog_tag: String,
    pub cache_hit: bool,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_ms: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub request_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub catalog_tag: String,
    pub cards: usize,
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub catalog_tag: String,
    pub catalog_cards: usize,
    pub refresher_running: bool,
}

fn error_response(status: StatusCode, request_id: String, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            request_id,
        }),
    )
        .into_response()
}

/// Empty filter strings mean "no filter".
fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn theme_preview(
    State(state): State<Arc<AppState>>,
    Path(theme): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let server = &state.config.server;
    let limit = query
        .limit
        .unwrap_or(server.default_limit)
        .clamp(1, server.max_limit.max(1));
    let catalog_tag = state.catalog.read().await.tag().to_string();

    let mut key = CacheKey::new(theme.trim(), limit, catalog_tag);
    if let Some(colors) = non_empty(query.colors) {
        key = key.with_colors(colors);
    }
    if let Some(commander) = non_empty(query.commander) {
        key = key.with_commander(commander);
    }

    match state.cache.get_or_build(key).await {
        Ok(lookup) => {
            info!(
                request_id = %request_id,
                theme = %lookup.payload.theme,
                limit,
                items = lookup.payload.items.len(),
                cache_hit = lookup.cache_hit(),
                "Theme preview"
            );
            let source = match lookup.source {
                LookupSource::Memory => "memory",
                LookupSource::Backend => "backend",
                LookupSource::Builder => "builder",
            };
            let cache_hit = lookup.cache_hit();
            let ThemePreview {
                theme,
                items,
                catalog_tag,
            } = lookup.payload;
            Json(PreviewResponse {
                request_id,
                theme,
                limit,
                items,
                catalog_tag,
                cache_hit,
                source: source.to_string(),
                build_ms: lookup.build_ms,
            })
            .into_response()
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Theme preview failed");
            error_response(StatusCode::NOT_FOUND, request_id, "failed to build preview")
        }
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheSnapshot> {
    Json(state.cache.snapshot().await)
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let removed = state.cache.clear("manual").await;
    Json(ClearResponse { removed })
}

async fn reload_catalog(State(state): State<Arc<AppState>>) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let path = {
        let current = state.catalog.read().await;
        current
            .source()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| state.config.server.catalog_path.clone())
    };

    let loaded = match tokio::task::spawn_blocking(move || Catalog::load(&path)).await {
        Ok(Ok(catalog)) => catalog,
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, "Catalog reload failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, request_id, e.to_string());
        }
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Catalog reload task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, request_id, "catalog reload failed");
        }
    };

    let catalog_tag = loaded.tag().to_string();
    let cards = loaded.len();
    *state.catalog.write().await = Arc::new(loaded);
    let removed = state.cache.clear("catalog_reload").await;

    info!(request_id = %request_id, catalog_tag = %catalog_tag, cards, removed, "Catalog reloaded");
    Json(ReloadResponse {
        catalog_tag,
        cards,
        removed,
    })
    .into_response()
}

async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.encode_prometheus().await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (catalog_tag, catalog_cards) = {
        let catalog = state.catalog.read().await;
        (catalog.tag().to_string(), catalog.len())
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        entries: state.cache.len().await,
        capacity: state.config.cache.capacity,
        ttl_secs: state.cache.ttl().await.as_secs(),
        catalog_tag,
        catalog_cards,
        refresher_running: state.cache.refresher_started() && state.cache.refresher_enabled(),
    })
}
