//! Integration tests for the HTTP API over a real catalog file.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt; // for `oneshot`

use preview_cache::cache::service::PreviewCache;
use preview_cache::catalog::{new_shared_catalog, Catalog, CatalogBuilder, ThemePreview};
use preview_cache::config::Config;
use preview_cache::server::preview_api::{build_router, AppState};

const CATALOG: &str = r#"{ "cards": [
    { "name": "Elf A", "colors": "G", "themes": ["Tokens"], "curated_for": ["Tokens"] },
    { "name": "Elf B", "colors": "G", "themes": ["Tokens"], "synergy": ["Rhys"] },
    { "name": "Soldier", "colors": "W", "themes": ["Tokens"] },
    { "name": "Golem", "themes": ["Tokens"] }
] }"#;

struct Harness {
    app: Router,
    catalog_file: NamedTempFile,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

/// `configure` runs after sanitizing, so it can install values the
/// loader would have rejected.
fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let mut catalog_file = NamedTempFile::new().unwrap();
    catalog_file.write_all(CATALOG.as_bytes()).unwrap();
    catalog_file.flush().unwrap();

    let mut config = Config::default();
    config.refresh.enabled = false;
    config.server.catalog_path = catalog_file.path().to_path_buf();
    config.server.default_limit = 3;
    config.server.max_limit = 10;
    let mut config = config.sanitize();
    configure(&mut config);
    let config = Arc::new(config);

    let catalog = new_shared_catalog(Catalog::load(catalog_file.path()).unwrap());
    let builder = Arc::new(CatalogBuilder::new(catalog.clone()));
    let cache = PreviewCache::<ThemePreview>::with_backend(&config, builder, None).unwrap();

    let state = Arc::new(AppState {
        cache,
        catalog,
        config,
        start_time: Instant::now(),
    });
    Harness {
        app: build_router(state),
        catalog_file,
    }
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, method, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_preview_miss_then_hit() {
    let h = harness();

    let (status, first) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cache_hit"], false);
    assert_eq!(first["source"], "builder");
    assert_eq!(first["limit"], 3);
    assert_eq!(first["items"].as_array().unwrap().len(), 3);

    let (status, second) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cache_hit"], true);
    assert_eq!(second["items"], first["items"]);
    assert_ne!(second["request_id"], first["request_id"]);
}

#[tokio::test]
async fn test_preview_filters_and_bias() {
    let h = harness();

    let (_, body) = send_json(
        &h.app,
        Method::GET,
        "/v1/themes/tokens/preview?limit=10&colors=G&commander=Rhys",
    )
    .await;
    let names: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 3);
    assert_eq!(names[0], "Elf B");
    assert!(!names.contains(&"Soldier"));

    // Limits are clamped to the configured maximum.
    let (_, body) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview?limit=999").await;
    assert_eq!(body["limit"], 10);
}

#[tokio::test]
async fn test_unknown_theme_is_empty_not_error() {
    let h = harness();
    let (status, body) = send_json(&h.app, Method::GET, "/v1/themes/nonexistent/preview").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"].as_array().unwrap().is_empty());

    let (_, again) = send_json(&h.app, Method::GET, "/v1/themes/nonexistent/preview").await;
    assert_eq!(again["cache_hit"], true);
}

#[tokio::test]
async fn test_stats_and_clear() {
    let h = harness();
    send(&h.app, Method::GET, "/v1/themes/tokens/preview").await;
    send(&h.app, Method::GET, "/v1/themes/tokens/preview").await;

    let (status, stats) = send_json(&h.app, Method::GET, "/v1/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["requests"], 2);
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["ttl_secs"], 600);

    let (status, cleared) = send_json(&h.app, Method::POST, "/v1/cache/clear").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["removed"], 1);

    let (_, stats) = send_json(&h.app, Method::GET, "/v1/cache/stats").await;
    assert_eq!(stats["entries"], 0);
    assert_eq!(stats["last_bust_reason"], "manual");
}

#[tokio::test]
async fn test_catalog_reload_retags_and_clears() {
    let h = harness();
    let (_, before) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview").await;

    let updated = CATALOG.replace("Golem", "Myr");
    std::fs::write(h.catalog_file.path(), updated).unwrap();

    let (status, reload) = send_json(&h.app, Method::POST, "/v1/catalog/reload").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reload["removed"], 1);
    assert_eq!(reload["cards"], 4);
    assert_ne!(reload["catalog_tag"], before["catalog_tag"]);

    let (_, after) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview").await;
    assert_eq!(after["cache_hit"], false);
    assert_eq!(after["catalog_tag"], reload["catalog_tag"]);
}

#[tokio::test]
async fn test_catalog_reload_failure_keeps_cache() {
    let h = harness();
    send(&h.app, Method::GET, "/v1/themes/tokens/preview").await;

    std::fs::write(h.catalog_file.path(), "not json").unwrap();
    let (status, body) = send_json(&h.app, Method::POST, "/v1/catalog/reload").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("parsing catalog"));

    let (_, again) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview").await;
    assert_eq!(again["cache_hit"], true);
}

#[tokio::test]
async fn test_metrics_and_health() {
    let h = harness();
    send(&h.app, Method::GET, "/v1/themes/tokens/preview").await;

    let (status, body) = send(&h.app, Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("preview_cache_requests_total 1"));
    assert!(text.contains("preview_cache_ttl_seconds 600"));

    let (status, health) = send_json(&h.app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["entries"], 1);
    assert_eq!(health["catalog_cards"], 4);
    assert_eq!(health["refresher_running"], false);
}

#[tokio::test]
async fn test_zero_max_limit_still_serves() {
    let h = harness_with(|config| config.server.max_limit = 0);
    let (status, body) = send_json(&h.app, Method::GET, "/v1/themes/tokens/preview?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}
