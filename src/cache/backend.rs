//! Optional write-through backend.
//!
//! A secondary key/value store written after every local put and read only
//! when the in-memory store misses. It is never consulted for eviction and
//! every failure is swallowed by the caller and counted.
//!
//! - [`HttpBackend`]: `GET`/`PUT {base}/{key}` against a remote store
//! - [`MemoryBackend`]: in-process map, for single-node setups and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BackendConfig;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Unexpected status {status} for {key}")]
    Status { status: u16, key: String },

    #[error("Backend operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported backend URL: {0}")]
    UnsupportedUrl(String),
}

/// A best-effort secondary store keyed by [`CacheKey::storage_key`].
///
/// [`CacheKey::storage_key`]: crate::cache::entry::CacheKey::storage_key
#[async_trait]
pub trait WriteThroughBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetch a serialized value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Store a serialized value that should live for roughly `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError>;
}

/// Remote store speaking plain HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Every request, read or write, is abandoned after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(key))
    }
}

#[async_trait]
impl WriteThroughBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let response = self.client.get(self.url_for(key)).send().await?;
        match response.status() {
            s if s == reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.text().await?)),
            s => Err(BackendError::Status {
                status: s.as_u16(),
                key: key.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        let response = self
            .client
            .put(self.url_for(key))
            .header("content-type", "application/json")
            .header("x-ttl-seconds", ttl.as_secs().to_string())
            .body(value)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: response.status().as_u16(),
                key: key.to_string(),
            })
        }
    }
}

/// In-process store honoring per-value TTLs.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.values.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.lock().await.is_empty()
    }
}

#[async_trait]
impl WriteThroughBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut values = self.values.lock().await;
        match values.get(key) {
            None => return Ok(None),
            Some((value, expires)) if *expires > Instant::now() => return Ok(Some(value.clone())),
            Some(_) => {}
        }
        values.remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        let expires = Instant::now() + ttl;
        self.values.lock().await.insert(key.to_string(), (value, expires));
        Ok(())
    }
}

/// Build the configured backend, if any.
pub fn backend_from_config(
    config: &BackendConfig,
) -> Result<Option<Arc<dyn WriteThroughBackend>>, BackendError> {
    if config.disabled {
        return Ok(None);
    }
    let Some(url) = config.url.as_deref() else {
        return Ok(None);
    };

    let backend: Arc<dyn WriteThroughBackend> = if url.starts_with("memory://") {
        Arc::new(MemoryBackend::new())
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let timeout = config.read_timeout().max(config.write_timeout());
        Arc::new(HttpBackend::new(url, timeout)?)
    } else {
        warn!(url, "Write-through backend URL not understood");
        return Err(BackendError::UnsupportedUrl(url.to_string()));
    };

    info!(backend = backend.name(), "Write-through backend enabled");
    Ok(Some(backend))
}
