//! Cache telemetry.
//!
//! Counters and histograms live in a Prometheus registry owned by the
//! cache instance, so several caches (or tests) never collide on metric
//! names. Exact avg/p50/p95 figures and per-key tallies are kept in
//! bounded windows next to them for the JSON snapshot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, UNIX_EPOCH};

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use crate::cache::entry::CacheKey;
use crate::cache::evictor::{EvictionReason, EvictionRecord};
use crate::cache::store::CacheStore;
use crate::cache::ttl::{TtlAdjustment, TtlController};

/// Build latency buckets (seconds): 1ms .. 10s.
const BUILD_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.015, 0.025, 0.040, 0.100, 0.250, 0.500, 1.0, 2.5, 10.0,
];

/// Build durations kept per key.
const KEY_LATENCY_WINDOW: usize = 100;

/// Keys listed in a snapshot.
const SNAPSHOT_TOP_KEYS: usize = 50;

/// Where a build was triggered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOrigin {
    Request,
    Refresh,
    Prewarm,
}

impl BuildOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            BuildOrigin::Request => "request",
            BuildOrigin::Refresh => "refresh",
            BuildOrigin::Prewarm => "prewarm",
        }
    }
}

/// Bounded window of recent latencies in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Nearest-rank percentile, `q` in `[0, 1]`. Zero when empty.
    pub fn percentile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let rank = (q.clamp(0.0, 1.0) * n as f64).ceil() as usize;
        sorted[rank.clamp(1, n) - 1]
    }
}

#[derive(Debug, Clone)]
struct KeyStats {
    requests: u64,
    hits: u64,
    builds: u64,
    errors: u64,
    latency: LatencyWindow,
    curated_sum: f64,
    curated_samples: u64,
}

impl Default for KeyStats {
    fn default() -> Self {
        Self {
            requests: 0,
            hits: 0,
            builds: 0,
            errors: 0,
            latency: LatencyWindow::new(KEY_LATENCY_WINDOW),
            curated_sum: 0.0,
            curated_samples: 0,
        }
    }
}

/// Counters, gauges and latency windows for one cache instance.
pub struct CacheMetrics {
    registry: Registry,
    requests_total: IntCounter,
    hits_total: IntCounter,
    misses_total: IntCounter,
    builds_total: IntCounterVec,
    build_errors_total: IntCounter,
    evictions_total: IntCounterVec,
    backend_ops_total: IntCounterVec,
    refresh_cycles_total: IntCounter,
    entries: IntGauge,
    ttl_seconds: IntGauge,
    build_duration_seconds: Histogram,

    build_latency: LatencyWindow,
    per_key: HashMap<CacheKey, KeyStats>,
    max_tracked_keys: usize,
    last_eviction: Option<EvictionRecord>,
    last_refresh_interval: Option<Duration>,
}

impl CacheMetrics {
    /// Create and register all metrics in a fresh registry.
    pub fn new(latency_window: usize, max_tracked_keys: usize) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("preview_cache".to_string()), None)?;

        let requests_total = IntCounter::new("requests_total", "Preview lookups")?;
        let hits_total = IntCounter::new("hits_total", "Lookups served from a fresh entry")?;
        let misses_total = IntCounter::new("misses_total", "Lookups that required a build or backend read")?;
        let builds_total = IntCounterVec::new(
            Opts::new("builds_total", "Successful builder calls"),
            &["origin"],
        )?;
        let build_errors_total =
            IntCounter::new("build_errors_total", "Requests whose build failed after retries")?;
        let evictions_total = IntCounterVec::new(
            Opts::new("evictions_total", "Entries removed by the eviction policy"),
            &["reason"],
        )?;
        let backend_ops_total = IntCounterVec::new(
            Opts::new("backend_ops_total", "Write-through backend operations"),
            &["op", "outcome"],
        )?;
        let refresh_cycles_total =
            IntCounter::new("refresh_cycles_total", "Background refresh cycles completed")?;
        let entries = IntGauge::new("entries", "Entries currently stored")?;
        let ttl_seconds = IntGauge::new("ttl_seconds", "Current adaptive TTL")?;
        let build_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("build_duration_seconds", "Builder latency")
                .buckets(BUILD_LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(hits_total.clone()))?;
        registry.register(Box::new(misses_total.clone()))?;
        registry.register(Box::new(builds_total.clone()))?;
        registry.register(Box::new(build_errors_total.clone()))?;
        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(backend_ops_total.clone()))?;
        registry.register(Box::new(refresh_cycles_total.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(ttl_seconds.clone()))?;
        registry.register(Box::new(build_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            hits_total,
            misses_total,
            builds_total,
            build_errors_total,
            evictions_total,
            backend_ops_total,
            refresh_cycles_total,
            entries,
            ttl_seconds,
            build_duration_seconds,
            build_latency: LatencyWindow::new(latency_window),
            per_key: HashMap::new(),
            max_tracked_keys: max_tracked_keys.max(1),
            last_eviction: None,
            last_refresh_interval: None,
        })
    }

    fn key_stats(&mut self, key: &CacheKey) -> &mut KeyStats {
        if !self.per_key.contains_key(key) && self.per_key.len() >= self.max_tracked_keys {
            let coldest = self
                .per_key
                .iter()
                .min_by_key(|(_, s)| s.requests)
                .map(|(k, _)| k.clone());
            if let Some(coldest) = coldest {
                self.per_key.remove(&coldest);
            }
        }
        self.per_key.entry(key.clone()).or_default()
    }

    pub fn record_request(&mut self, key: &CacheKey) {
        self.requests_total.inc();
        self.key_stats(key).requests += 1;
    }

    pub fn record_hit(&mut self, key: &CacheKey) {
        self.hits_total.inc();
        self.key_stats(key).hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses_total.inc();
    }

    pub fn record_build(
        &mut self,
        key: &CacheKey,
        origin: BuildOrigin,
        duration_ms: f64,
        curated_ratio: Option<f64>,
    ) {
        self.builds_total.with_label_values(&[origin.as_str()]).inc();
        self.build_duration_seconds.observe(duration_ms / 1000.0);
        self.build_latency.push(duration_ms);

        let stats = self.key_stats(key);
        stats.builds += 1;
        stats.latency.push(duration_ms);
        if let Some(ratio) = curated_ratio.filter(|r| r.is_finite()) {
            stats.curated_sum += ratio;
            stats.curated_samples += 1;
        }
    }

    pub fn record_build_error(&mut self, key: &CacheKey) {
        self.build_errors_total.inc();
        self.key_stats(key).errors += 1;
    }

    pub fn record_evictions(&mut self, records: &[EvictionRecord]) {
        for record in records {
            self.evictions_total
                .with_label_values(&[record.reason.as_str()])
                .inc();
        }
        if let Some(last) = records.last() {
            self.last_eviction = Some(last.clone());
        }
    }

    /// Handle for counting backend outcomes outside the state lock,
    /// labelled `op` (read/write) and `outcome` (ok/hit/miss/error).
    pub fn backend_ops(&self) -> IntCounterVec {
        self.backend_ops_total.clone()
    }

    pub fn record_refresh_cycle(&mut self, next_interval: Duration) {
        self.refresh_cycles_total.inc();
        self.last_refresh_interval = Some(next_interval);
    }

    pub fn set_refresh_interval(&mut self, interval: Duration) {
        self.last_refresh_interval = Some(interval);
    }

    pub fn set_gauges(&self, entries: usize, ttl_secs: u64) {
        self.entries.set(entries as i64);
        self.ttl_seconds.set(ttl_secs as i64);
    }

    /// Forget per-key tallies, e.g. after the catalog changed.
    pub fn reset_keys(&mut self) {
        self.per_key.clear();
    }

    /// Keys ordered by request count, most requested first.
    pub fn top_requested(&self, n: usize) -> Vec<CacheKey> {
        let mut keys: Vec<(&CacheKey, u64)> =
            self.per_key.iter().map(|(k, s)| (k, s.requests)).collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        keys.into_iter().take(n).map(|(k, _)| k.clone()).collect()
    }

    pub fn build_p95_ms(&self) -> f64 {
        self.build_latency.percentile(0.95)
    }

    /// Failed builds over all build outcomes; zero before any build.
    pub fn build_error_rate(&self) -> f64 {
        let errors = self.build_errors_total.get();
        let builds: u64 = [BuildOrigin::Request, BuildOrigin::Refresh, BuildOrigin::Prewarm]
            .iter()
            .map(|o| self.builds_total.with_label_values(&[o.as_str()]).get())
            .sum();
        let total = errors + builds;
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    pub fn evictions_by_reason(&self) -> BTreeMap<String, u64> {
        EvictionReason::ALL
            .iter()
            .map(|r| {
                (
                    r.as_str().to_string(),
                    self.evictions_total.with_label_values(&[r.as_str()]).get(),
                )
            })
            .collect()
    }

    /// Prometheus text exposition of this instance's registry.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    pub fn snapshot<P: Clone>(&self, store: &CacheStore<P>, ttl: &TtlController) -> CacheSnapshot {
        let requests = self.requests_total.get();
        let hits = self.hits_total.get();
        let evictions_by_reason = self.evictions_by_reason();

        let mut per_key: Vec<KeyStatsSnapshot> = self
            .per_key
            .iter()
            .map(|(key, s)| KeyStatsSnapshot {
                key: key.clone(),
                requests: s.requests,
                hits: s.hits,
                builds: s.builds,
                errors: s.errors,
                avg_ms: s.latency.mean(),
                p50_ms: s.latency.percentile(0.50),
                p95_ms: s.latency.percentile(0.95),
                curated_ratio: (s.curated_samples > 0)
                    .then(|| s.curated_sum / s.curated_samples as f64),
            })
            .collect();
        per_key.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.key.cmp(&b.key)));
        per_key.truncate(SNAPSHOT_TOP_KEYS);

        let bust = store.last_bust();

        CacheSnapshot {
            requests,
            hits,
            misses: self.misses_total.get(),
            hit_rate: if requests == 0 { 0.0 } else { hits as f64 / requests as f64 },
            entries: store.len(),
            capacity: store.capacity(),
            evictions: evictions_by_reason.values().sum(),
            evictions_by_reason,
            last_eviction: self.last_eviction.clone(),
            avg_build_ms: self.build_latency.mean(),
            p95_build_ms: self.build_latency.percentile(0.95),
            build_samples: self.build_latency.len(),
            build_errors: self.build_errors_total.get(),
            ttl_secs: ttl.ttl_secs(),
            ttl_min_secs: ttl.config().min_secs,
            ttl_max_secs: ttl.config().max_secs,
            last_ttl_adjustment: ttl.last_adjustment().copied(),
            recent_window_size: ttl.window().len(),
            recent_hit_ratio: ttl.window().hit_ratio(),
            last_bust_unix: bust
                .and_then(|b| b.at.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64()),
            last_bust_reason: bust.map(|b| b.reason.clone()),
            backend_writes_ok: self.backend_ops_total.with_label_values(&["write", "ok"]).get(),
            backend_read_hits: self.backend_ops_total.with_label_values(&["read", "hit"]).get(),
            backend_errors: self.backend_ops_total.with_label_values(&["write", "error"]).get()
                + self.backend_ops_total.with_label_values(&["read", "error"]).get(),
            refresh_cycles: self.refresh_cycles_total.get(),
            refresh_interval_secs: self.last_refresh_interval.map(|d| d.as_secs_f64()),
            per_key,
        }
    }
}

/// Per-key section of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatsSnapshot {
    pub key: CacheKey,
    pub requests: u64,
    pub hits: u64,
    pub builds: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub curated_ratio: Option<f64>,
}

/// Point-in-time view of the cache for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub evictions_by_reason: BTreeMap<String, u64>,
    pub last_eviction: Option<EvictionRecord>,
    pub avg_build_ms: f64,
    pub p95_build_ms: f64,
    pub build_samples: usize,
    pub build_errors: u64,
    pub ttl_secs: u64,
    pub ttl_min_secs: u64,
    pub ttl_max_secs: u64,
    pub last_ttl_adjustment: Option<TtlAdjustment>,
    pub recent_window_size: usize,
    pub recent_hit_ratio: Option<f64>,
    pub last_bust_unix: Option<f64>,
    pub last_bust_reason: Option<String>,
    pub backend_writes_ok: u64,
    pub backend_read_hits: u64,
    pub backend_errors: u64,
    pub refresh_cycles: u64,
    pub refresh_interval_secs: Option<f64>,
    pub per_key: Vec<KeyStatsSnapshot>,
}
