//! Cache orchestrator: the request path in front of the preview builder.
//!
//! All mutable state (entries, TTL controller, metrics) sits in one
//! [`CacheState`] behind a single mutex. Builder calls and backend I/O
//! always happen with the lock released.
//!
//! Two concurrent misses on the same key may both call the builder and
//! both store their result; the later put wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::IntCounterVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::backend::{backend_from_config, BackendError, WriteThroughBackend};
use crate::cache::entry::{CacheKey, CachePayload};
use crate::cache::evictor::{EvictionPolicy, EvictionRecord};
use crate::cache::metrics::{BuildOrigin, CacheMetrics, CacheSnapshot};
use crate::cache::refresher;
use crate::cache::scorer::ProtectionScorer;
use crate::cache::store::CacheStore;
use crate::cache::ttl::TtlController;
use crate::config::{CacheConfig, Config, RefreshConfig};

/// Error type builders may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Produces a payload for a cache miss.
///
/// Repeated calls for the same key should return comparable payloads;
/// they do not need to be identical.
#[async_trait]
pub trait PreviewBuilder<P>: Send + Sync {
    async fn build(&self, key: &CacheKey) -> Result<P, BoxError>;
}

/// The builder kept failing after all retries.
#[derive(Error, Debug)]
#[error("failed to build preview for {key} after {attempts} attempt(s): {source}")]
pub struct BuildError {
    pub key: CacheKey,
    pub attempts: u32,
    #[source]
    pub source: BoxError,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Where a returned payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    /// Fresh in-memory entry.
    Memory,
    /// Local miss served by the write-through backend.
    Backend,
    /// Local miss served by the builder.
    Builder,
}

/// A payload annotated with how it was obtained.
#[derive(Debug, Clone)]
pub struct Lookup<P> {
    pub payload: P,
    pub source: LookupSource,
    /// Duration of the successful builder call, for builder results.
    pub build_ms: Option<f64>,
}

impl<P> Lookup<P> {
    pub fn cache_hit(&self) -> bool {
        self.source == LookupSource::Memory
    }
}

/// Shape of values written to the backend.
#[derive(Serialize, Deserialize)]
struct StoredPreview<P> {
    build_cost_ms: f64,
    payload: P,
}

pub(crate) struct CacheState<P> {
    pub(crate) store: CacheStore<P>,
    pub(crate) ttl: TtlController,
    pub(crate) metrics: CacheMetrics,
}

impl<P: Clone> CacheState<P> {
    fn adapt(&mut self, now: Instant) {
        if let Some(adj) = self.ttl.maybe_adapt(now) {
            if adj.previous_secs != adj.current_secs {
                info!(
                    previous = adj.previous_secs,
                    current = adj.current_secs,
                    hit_ratio = adj.hit_ratio,
                    "Adapted preview TTL"
                );
            } else {
                debug!(ttl = adj.current_secs, hit_ratio = adj.hit_ratio, "TTL unchanged");
            }
        }
        self.sync_gauges();
    }

    fn sync_gauges(&self) {
        self.metrics.set_gauges(self.store.len(), self.ttl.ttl_secs());
    }

    fn record_evictions(&mut self, records: &[EvictionRecord]) {
        if !records.is_empty() {
            self.metrics.record_evictions(records);
        }
    }
}

/// Shared preview cache service.
pub struct PreviewCache<P: CachePayload> {
    cache_config: CacheConfig,
    refresh_config: RefreshConfig,
    backend_timeout: Duration,
    backend_write_timeout: Duration,
    state: Mutex<CacheState<P>>,
    builder: Arc<dyn PreviewBuilder<P>>,
    backend: Option<Arc<dyn WriteThroughBackend>>,
    backend_ops: IntCounterVec,
    refresher_started: AtomicBool,
    refresher_enabled: AtomicBool,
    refresher_stop: Arc<Notify>,
}

impl<P: CachePayload> PreviewCache<P> {
    /// Create a cache with the backend described by `config.backend`.
    pub fn new(config: &Config, builder: Arc<dyn PreviewBuilder<P>>) -> Result<Arc<Self>, CacheError> {
        let backend = backend_from_config(&config.backend)?;
        Self::with_backend(config, builder, backend)
    }

    /// Create a cache with an explicit backend (or none).
    ///
    /// Out-of-range values in `config` are replaced by their defaults.
    pub fn with_backend(
        config: &Config,
        builder: Arc<dyn PreviewBuilder<P>>,
        backend: Option<Arc<dyn WriteThroughBackend>>,
    ) -> Result<Arc<Self>, CacheError> {
        let config = config.clone().sanitize();
        let policy = EvictionPolicy::new(ProtectionScorer::new(config.eviction.clone()));
        let metrics = CacheMetrics::new(config.cache.latency_window, config.cache.max_tracked_keys)?;
        let backend_ops = metrics.backend_ops();
        let state = CacheState {
            store: CacheStore::new(config.cache.capacity, policy),
            ttl: TtlController::new(config.ttl.clone()),
            metrics,
        };
        state.sync_gauges();

        Ok(Arc::new(Self {
            cache_config: config.cache.clone(),
            refresh_config: config.refresh.clone(),
            backend_timeout: config.backend.read_timeout(),
            backend_write_timeout: config.backend.write_timeout(),
            state: Mutex::new(state),
            builder,
            backend,
            backend_ops,
            refresher_started: AtomicBool::new(false),
            refresher_enabled: AtomicBool::new(config.refresh.enabled),
            refresher_stop: Arc::new(Notify::new()),
        }))
    }

    /// Serve `key` from memory when fresh, otherwise from the backend or
    /// the builder.
    pub async fn get_or_build(self: &Arc<Self>, key: CacheKey) -> Result<Lookup<P>, BuildError> {
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = Instant::now();
            state.metrics.record_request(&key);
            let ttl = state.ttl.ttl();
            if let Some(payload) = state.store.get_fresh(&key, ttl, now) {
                state.ttl.record_request_hit(true);
                state.metrics.record_hit(&key);
                state.adapt(now);
                return Ok(Lookup {
                    payload,
                    source: LookupSource::Memory,
                    build_ms: None,
                });
            }
            state.ttl.record_request_hit(false);
            state.metrics.record_miss();
        }

        if let Some(stored) = self.read_through(&key).await {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = Instant::now();
            let records = state
                .store
                .put(key.clone(), stored.payload.clone(), stored.build_cost_ms, now);
            state.record_evictions(&records);
            state.adapt(now);
            debug!(key = %key, "Preview served from write-through backend");
            return Ok(Lookup {
                payload: stored.payload,
                source: LookupSource::Backend,
                build_ms: None,
            });
        }

        let (payload, build_ms) = self.build_with_retries(&key).await?;
        self.store_built(key, &payload, build_ms, BuildOrigin::Request).await;
        self.ensure_refresher();

        Ok(Lookup {
            payload,
            source: LookupSource::Builder,
            build_ms: Some(build_ms),
        })
    }

    async fn build_with_retries(&self, key: &CacheKey) -> Result<(P, f64), BuildError> {
        let max_attempts = self.cache_config.build_retries.saturating_add(1);
        let backoff = Duration::from_millis(self.cache_config.retry_backoff_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.builder.build(key).await {
                Ok(payload) => return Ok((payload, elapsed_ms(started))),
                Err(e) if attempt < max_attempts => {
                    warn!(key = %key, attempt, error = %e, "Preview build failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(key = %key, attempts = attempt, error = %e, "Preview build failed");
                    self.state.lock().await.metrics.record_build_error(key);
                    return Err(BuildError {
                        key: key.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Store a freshly built payload, record it, and write it through.
    pub(crate) async fn store_built(&self, key: CacheKey, payload: &P, build_ms: f64, origin: BuildOrigin) {
        let curated = payload.curated_ratio();
        let ttl = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = Instant::now();
            let records = state.store.put(key.clone(), payload.clone(), build_ms, now);
            state.record_evictions(&records);
            state.metrics.record_build(&key, origin, build_ms, curated);
            if origin == BuildOrigin::Request {
                state.adapt(now);
            } else {
                state.sync_gauges();
            }
            state.ttl.ttl()
        };
        self.write_through(&key, payload, build_ms, ttl);
    }

    pub(crate) async fn record_build_failure(&self, key: &CacheKey) {
        self.state.lock().await.metrics.record_build_error(key);
    }

    async fn read_through(&self, key: &CacheKey) -> Option<StoredPreview<P>> {
        let backend = self.backend.as_ref()?;
        let storage_key = key.storage_key();

        let raw = match tokio::time::timeout(self.backend_timeout, backend.get(&storage_key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                self.backend_ops.with_label_values(&["read", "miss"]).inc();
                return None;
            }
            Ok(Err(e)) => {
                self.backend_ops.with_label_values(&["read", "error"]).inc();
                debug!(key = %key, error = %e, "Backend read failed");
                return None;
            }
            Err(_) => {
                self.backend_ops.with_label_values(&["read", "error"]).inc();
                let e = BackendError::Timeout(self.backend_timeout);
                debug!(key = %key, error = %e, "Backend read failed");
                return None;
            }
        };

        match serde_json::from_str::<StoredPreview<P>>(&raw) {
            Ok(stored) => {
                self.backend_ops.with_label_values(&["read", "hit"]).inc();
                Some(stored)
            }
            Err(e) => {
                self.backend_ops.with_label_values(&["read", "error"]).inc();
                debug!(key = %key, error = %e, "Backend value did not decode");
                None
            }
        }
    }

    /// Fire-and-forget write to the backend. Never blocks the caller.
    fn write_through(&self, key: &CacheKey, payload: &P, build_ms: f64, ttl: Duration) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let counter = self.backend_ops.clone();

        let value = match serde_json::to_string(&StoredPreview {
            build_cost_ms: build_ms,
            payload,
        }) {
            Ok(value) => value,
            Err(e) => {
                counter.with_label_values(&["write", "error"]).inc();
                debug!(key = %key, error = %e, "Could not serialize preview for backend");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            counter.with_label_values(&["write", "error"]).inc();
            return;
        };
        let storage_key = key.storage_key();
        let limit = self.backend_write_timeout;
        runtime.spawn(async move {
            let result = match tokio::time::timeout(limit, backend.put(&storage_key, value, ttl)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(limit)),
            };
            match result {
                Ok(()) => counter.with_label_values(&["write", "ok"]).inc(),
                Err(e) => {
                    counter.with_label_values(&["write", "error"]).inc();
                    debug!(key = %storage_key, error = %e, "Backend write failed");
                }
            }
        });
    }

    /// Build `keys` concurrently and insert the successes in one batch.
    ///
    /// Returns the number of entries inserted.
    pub async fn prewarm(self: &Arc<Self>, keys: Vec<CacheKey>) -> usize {
        let mut tasks = JoinSet::new();
        for key in keys {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.build_with_retries(&key).await;
                (key, result)
            });
        }

        let mut built = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok((payload, ms)))) => built.push((key, payload, ms)),
                Ok((_, Err(e))) => warn!(error = %e, "Prewarm build failed"),
                Err(e) => warn!(error = %e, "Prewarm task panicked"),
            }
        }
        let inserted = built.len();

        let ttl = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            for (key, payload, ms) in &built {
                state
                    .metrics
                    .record_build(key, BuildOrigin::Prewarm, *ms, payload.curated_ratio());
            }
            let now = Instant::now();
            let records = state.store.put_batch(
                built.iter().map(|(k, p, ms)| (k.clone(), p.clone(), *ms)),
                now,
            );
            state.record_evictions(&records);
            state.sync_gauges();
            state.ttl.ttl()
        };
        for (key, payload, ms) in &built {
            self.write_through(key, payload, *ms, ttl);
        }

        info!(inserted, "Prewarm complete");
        inserted
    }

    /// Drop every entry, e.g. after a catalog reload. Per-key tallies are
    /// reset as well so the refresher stops rebuilding obsolete keys.
    pub async fn clear(&self, reason: &str) -> usize {
        let mut guard = self.state.lock().await;
        let removed = guard.store.clear(reason);
        guard.metrics.reset_keys();
        guard.sync_gauges();
        info!(removed, reason, "Preview cache cleared");
        removed
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let guard = self.state.lock().await;
        guard.metrics.snapshot(&guard.store, &guard.ttl)
    }

    /// Prometheus text exposition.
    pub async fn encode_prometheus(&self) -> Result<String, CacheError> {
        let guard = self.state.lock().await;
        guard.sync_gauges();
        Ok(guard.metrics.encode()?)
    }

    pub async fn ttl(&self) -> Duration {
        self.state.lock().await.ttl.ttl()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.store.is_empty()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().await.store.contains(key)
    }

    pub(crate) fn builder(&self) -> &Arc<dyn PreviewBuilder<P>> {
        &self.builder
    }

    pub(crate) fn refresh_config(&self) -> &RefreshConfig {
        &self.refresh_config
    }

    pub(crate) async fn with_state<R>(&self, f: impl FnOnce(&mut CacheState<P>) -> R) -> R {
        let mut guard = self.state.lock().await;
        f(&mut guard)
    }

    /// Start the background refresher once, if enabled.
    fn ensure_refresher(self: &Arc<Self>) {
        if !self.refresher_enabled() {
            return;
        }
        if self
            .refresher_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.refresher_started.store(false, Ordering::Release);
            warn!("No async runtime, background refresher not started");
            return;
        };
        runtime.spawn(refresher::run(Arc::downgrade(self), Arc::clone(&self.refresher_stop)));
        info!("Background refresher started");
    }

    pub fn refresher_enabled(&self) -> bool {
        self.refresher_enabled.load(Ordering::Acquire)
    }

    /// True while the background task is alive.
    pub fn refresher_started(&self) -> bool {
        self.refresher_started.load(Ordering::Acquire)
    }

    /// Disable the refresher; a sleeping refresher wakes up and exits.
    pub fn stop_refresher(&self) {
        self.refresher_enabled.store(false, Ordering::Release);
        self.refresher_stop.notify_one();
    }

    pub(crate) fn refresher_exited(&self) {
        self.refresher_started.store(false, Ordering::Release);
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
