//! preview-cache: adaptive theme preview cache server.
//!
//! Loads a card catalog, puts an adaptive cache in front of the preview
//! sampler and exposes it over HTTP together with stats and Prometheus
//! metrics.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use preview_cache::cache::entry::CacheKey;
use preview_cache::cache::service::PreviewCache;
use preview_cache::catalog::{new_shared_catalog, Catalog, CatalogBuilder, ThemePreview};
use preview_cache::config::{Cli, Config};
use preview_cache::server::preview_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "preview_cache=debug,tower_http=debug"
    } else {
        "preview_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("preview-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: file, then environment, then CLI.
    let mut config = Config::load(&cli.config)?;
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(catalog) = cli.catalog {
        config.server.catalog_path = catalog;
    }
    let config = Arc::new(config.sanitize());

    info!(
        capacity = config.cache.capacity,
        ttl_base = config.ttl.base_secs,
        ttl_min = config.ttl.min_secs,
        ttl_max = config.ttl.max_secs,
        refresh = config.refresh.enabled,
        backend = config.backend.url.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    // Load the catalog and build the cache in front of it.
    let catalog = Catalog::load(&config.server.catalog_path)?;
    let tag = catalog.tag().to_string();
    let catalog = new_shared_catalog(catalog);
    let builder = Arc::new(CatalogBuilder::new(catalog.clone()));
    let cache = PreviewCache::<ThemePreview>::new(&config, builder)?;

    // Pre-warm configured themes at the default preview size.
    if !config.server.prewarm_themes.is_empty() {
        let keys = config
            .server
            .prewarm_themes
            .iter()
            .map(|theme| CacheKey::new(theme.as_str(), config.server.default_limit, tag.as_str()))
            .collect();
        let inserted = cache.prewarm(keys).await;
        info!(inserted, "Pre-warmed themes");
    }

    // Build application state.
    let state = Arc::new(AppState {
        cache: cache.clone(),
        catalog,
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    cache.stop_refresher();
    info!("Server stopped");
    Ok(())
}
