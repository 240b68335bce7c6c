//! Runtime configuration for preview-cache.
//!
//! Configuration is loaded from a JSON file (every field optional), then
//! overlaid with `PREVIEW_CACHE_*` environment variables, then sanitized.
//! Values that fail to parse or validate keep their defaults and log a
//! warning; configuration never fails the process.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "preview-cache", about = "Adaptive theme preview cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Path to the card catalog (overrides the config file).
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// An environment value that could not be used.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid value {value:?} for {name}: expected {expected}")]
pub struct ConfigParseError {
    pub name: String,
    pub value: String,
    pub expected: &'static str,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Store sizing and request-path behaviour.
    pub cache: CacheConfig,

    /// Eviction scoring weights.
    pub eviction: EvictionConfig,

    /// Adaptive TTL controller.
    pub ttl: TtlConfig,

    /// Background refresher.
    pub refresh: RefreshConfig,

    /// Optional write-through backend.
    pub backend: BackendConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Path to the JSON card catalog.
    pub catalog_path: PathBuf,

    /// Default number of cards in a preview when the request omits `limit`.
    pub default_limit: usize,

    /// Upper bound on the requested preview size.
    pub max_limit: usize,

    /// Themes to build and insert before serving traffic.
    pub prewarm_themes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            catalog_path: PathBuf::from("catalog.json"),
            default_limit: 12,
            max_limit: 60,
            prewarm_themes: Vec::new(),
        }
    }
}

/// Store sizing and request-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in.
    pub capacity: usize,

    /// Additional builder attempts after the first failure.
    pub build_retries: u32,

    /// Fixed sleep between builder attempts, in milliseconds.
    pub retry_backoff_ms: u64,

    /// Number of recent build durations kept for avg/p95.
    pub latency_window: usize,

    /// Maximum number of keys with per-key stats.
    pub max_tracked_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 400,
            build_retries: 2,
            retry_backoff_ms: 50,
            latency_window: 500,
            max_tracked_keys: 2000,
        }
    }
}

/// Protection score weights and cost buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Weight for `ln(1 + hit_count)`.
    pub w_hits: f64,

    /// Weight for the recency term.
    pub w_recency: f64,

    /// Weight for the build cost bucket.
    pub w_cost: f64,

    /// Weight for minutes since insertion (subtracted).
    pub w_age: f64,

    /// Build cost bucket boundaries in milliseconds, ascending.
    pub cost_thresholds_ms: [f64; 3],
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            w_hits: 3.0,
            w_recency: 2.0,
            w_cost: 1.0,
            w_age: 1.5,
            cost_thresholds_ms: [5.0, 15.0, 40.0],
        }
    }
}

/// Adaptive TTL bounds, bands and steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Initial TTL and the convergence target of the middle band, in seconds.
    pub base_secs: u64,
    pub min_secs: u64,
    pub max_secs: u64,

    /// Hit-ratio band boundaries.
    pub low_critical: f64,
    pub low_moderate: f64,
    pub high_grow: f64,

    /// Step applied below `low_critical`.
    pub shrink_step_secs: u64,
    /// Step toward `base_secs` between `low_critical` and `low_moderate`.
    pub converge_step_secs: u64,
    /// Step applied between `low_moderate` and `high_grow`.
    pub grow_step_secs: u64,
    /// Step applied at or above `high_grow`.
    pub strong_grow_step_secs: u64,

    /// Capacity of the recent hit/miss window.
    pub window_size: usize,

    /// Minimum seconds between two adaptations.
    pub adapt_interval_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            base_secs: 600,
            min_secs: 300,
            max_secs: 1800,
            low_critical: 0.25,
            low_moderate: 0.55,
            high_grow: 0.75,
            shrink_step_secs: 60,
            converge_step_secs: 30,
            grow_step_secs: 60,
            strong_grow_step_secs: 90,
            window_size: 120,
            adapt_interval_secs: 30,
        }
    }
}

/// Background refresher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Start the refresher after the first build.
    pub enabled: bool,

    /// Nominal sleep between refresh cycles, in seconds.
    pub base_interval_secs: u64,

    /// Lower bound on the adaptive interval, in seconds.
    pub min_interval_secs: u64,

    /// Number of most-requested keys rebuilt per cycle.
    pub top_n: usize,

    /// p95 build latency above which the interval is stretched.
    pub slow_p95_ms: f64,

    /// Maximum stretch factor under slow builds.
    pub max_stretch: f64,

    /// Build error rate above which the interval is shrunk.
    pub high_error_rate: f64,

    /// Shrink factor under high error rates.
    pub error_shrink: f64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval_secs: 120,
            min_interval_secs: 30,
            top_n: 10,
            slow_p95_ms: 40.0,
            max_stretch: 1.75,
            high_error_rate: 0.2,
            error_shrink: 0.6,
        }
    }
}

/// Write-through backend settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `http(s)://...` for a remote store, `memory://` for an in-process one.
    pub url: Option<String>,

    /// Force-disable the backend even when a URL is set.
    pub disabled: bool,

    /// Read-through timeout in milliseconds.
    pub read_timeout_ms: u64,

    /// Upper bound on one background write, in milliseconds.
    pub write_timeout_ms: u64,
}

impl BackendConfig {
    /// Read-through timeout, defaulting when unset.
    pub fn read_timeout(&self) -> std::time::Duration {
        let ms = if self.read_timeout_ms == 0 { 250 } else { self.read_timeout_ms };
        std::time::Duration::from_millis(ms)
    }

    /// Write-through timeout, defaulting when unset.
    pub fn write_timeout(&self) -> std::time::Duration {
        let ms = if self.write_timeout_ms == 0 { 2000 } else { self.write_timeout_ms };
        std::time::Duration::from_millis(ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Overlay `PREVIEW_CACHE_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay values from an arbitrary lookup. Unparseable values are
    /// reported once and leave the field untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvOverlay { lookup };

        env.number("PREVIEW_CACHE_CAPACITY", &mut self.cache.capacity);
        env.number("PREVIEW_CACHE_BUILD_RETRIES", &mut self.cache.build_retries);

        env.number("PREVIEW_CACHE_W_HITS", &mut self.eviction.w_hits);
        env.number("PREVIEW_CACHE_W_RECENCY", &mut self.eviction.w_recency);
        env.number("PREVIEW_CACHE_W_COST", &mut self.eviction.w_cost);
        env.number("PREVIEW_CACHE_W_AGE", &mut self.eviction.w_age);
        if let Some([a, b, c]) = env.triple("PREVIEW_CACHE_COST_THRESHOLDS") {
            self.eviction.cost_thresholds_ms = [a, b, c];
        }

        env.number("PREVIEW_CACHE_TTL_BASE", &mut self.ttl.base_secs);
        env.number("PREVIEW_CACHE_TTL_MIN", &mut self.ttl.min_secs);
        env.number("PREVIEW_CACHE_TTL_MAX", &mut self.ttl.max_secs);
        if let Some([a, b, c]) = env.triple("PREVIEW_CACHE_TTL_BANDS") {
            self.ttl.low_critical = a;
            self.ttl.low_moderate = b;
            self.ttl.high_grow = c;
        }
        env.number("PREVIEW_CACHE_TTL_SHRINK_STEP", &mut self.ttl.shrink_step_secs);
        env.number("PREVIEW_CACHE_TTL_CONVERGE_STEP", &mut self.ttl.converge_step_secs);
        env.number("PREVIEW_CACHE_TTL_GROW_STEP", &mut self.ttl.grow_step_secs);
        env.number("PREVIEW_CACHE_TTL_STRONG_GROW_STEP", &mut self.ttl.strong_grow_step_secs);
        env.number("PREVIEW_CACHE_ADAPT_WINDOW", &mut self.ttl.window_size);
        env.number("PREVIEW_CACHE_ADAPT_INTERVAL", &mut self.ttl.adapt_interval_secs);

        env.flag("PREVIEW_CACHE_BG_REFRESH", &mut self.refresh.enabled);
        env.number("PREVIEW_CACHE_BG_REFRESH_INTERVAL", &mut self.refresh.base_interval_secs);
        env.number("PREVIEW_CACHE_BG_REFRESH_TOP_N", &mut self.refresh.top_n);

        if let Some(url) = (env.lookup)("PREVIEW_CACHE_BACKEND_URL") {
            let url = url.trim();
            self.backend.url = if url.is_empty() { None } else { Some(url.to_string()) };
        }
        env.flag("PREVIEW_CACHE_BACKEND_DISABLE", &mut self.backend.disabled);
    }

    /// Replace out-of-range values with defaults so downstream components
    /// can rely on well-formed numbers.
    pub fn sanitize(mut self) -> Self {
        let defaults = Config::default();

        if self.cache.capacity == 0 {
            warn!("cache.capacity must be positive, using {}", defaults.cache.capacity);
            self.cache.capacity = defaults.cache.capacity;
        }
        if self.cache.latency_window == 0 {
            self.cache.latency_window = defaults.cache.latency_window;
        }

        let ev = &mut self.eviction;
        let dev = &defaults.eviction;
        for (name, value, fallback) in [
            ("w_hits", &mut ev.w_hits, dev.w_hits),
            ("w_recency", &mut ev.w_recency, dev.w_recency),
            ("w_cost", &mut ev.w_cost, dev.w_cost),
            ("w_age", &mut ev.w_age, dev.w_age),
        ] {
            if !value.is_finite() || *value < 0.0 {
                warn!(weight = name, value = *value, "Invalid eviction weight, using default");
                *value = fallback;
            }
        }
        let [t1, t2, t3] = ev.cost_thresholds_ms;
        if ![t1, t2, t3].iter().all(|t| t.is_finite() && *t >= 0.0) || !(t1 <= t2 && t2 <= t3) {
            warn!(thresholds = ?ev.cost_thresholds_ms, "Cost thresholds must be ascending, using defaults");
            ev.cost_thresholds_ms = dev.cost_thresholds_ms;
        }

        let ttl = &mut self.ttl;
        let dttl = &defaults.ttl;
        if !(ttl.min_secs <= ttl.base_secs && ttl.base_secs <= ttl.max_secs) {
            warn!(
                min = ttl.min_secs,
                base = ttl.base_secs,
                max = ttl.max_secs,
                "TTL bounds must satisfy min <= base <= max, using defaults"
            );
            ttl.min_secs = dttl.min_secs;
            ttl.base_secs = dttl.base_secs;
            ttl.max_secs = dttl.max_secs;
        }
        let bands = [ttl.low_critical, ttl.low_moderate, ttl.high_grow];
        if !bands.iter().all(|b| b.is_finite() && (0.0..=1.0).contains(b))
            || !(bands[0] <= bands[1] && bands[1] <= bands[2])
        {
            warn!(?bands, "TTL hit-ratio bands must be ascending in [0, 1], using defaults");
            ttl.low_critical = dttl.low_critical;
            ttl.low_moderate = dttl.low_moderate;
            ttl.high_grow = dttl.high_grow;
        }
        if ttl.window_size < 2 {
            ttl.window_size = dttl.window_size;
        }

        let rf = &mut self.refresh;
        if rf.base_interval_secs == 0 {
            rf.base_interval_secs = defaults.refresh.base_interval_secs;
        }
        if !(rf.max_stretch.is_finite() && rf.max_stretch >= 1.0) {
            rf.max_stretch = defaults.refresh.max_stretch;
        }
        if !(rf.error_shrink.is_finite() && rf.error_shrink > 0.0 && rf.error_shrink <= 1.0) {
            rf.error_shrink = defaults.refresh.error_shrink;
        }

        if self.server.max_limit == 0 {
            self.server.max_limit = defaults.server.max_limit;
        }
        self.server.default_limit = self.server.default_limit.clamp(1, self.server.max_limit);

        self
    }
}

struct EnvOverlay<F> {
    lookup: F,
}

impl<F> EnvOverlay<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn number<T: FromStr>(&mut self, name: &str, slot: &mut T) {
        let Some(raw) = (self.lookup)(name) else { return };
        match parse_value::<T>(name, &raw, "a number") {
            Ok(v) => *slot = v,
            Err(e) => warn!("{e}; keeping current value"),
        }
    }

    fn flag(&mut self, name: &str, slot: &mut bool) {
        let Some(raw) = (self.lookup)(name) else { return };
        match parse_flag(name, &raw) {
            Ok(v) => *slot = v,
            Err(e) => warn!("{e}; keeping current value"),
        }
    }

    fn triple(&mut self, name: &str) -> Option<[f64; 3]> {
        let raw = (self.lookup)(name)?;
        let parts: Result<Vec<f64>, _> = raw
            .split(',')
            .map(|p| parse_value::<f64>(name, p, "three comma-separated numbers"))
            .collect();
        match parts.as_deref() {
            Ok([a, b, c]) => Some([*a, *b, *c]),
            Ok(_) => {
                let e = ConfigParseError {
                    name: name.to_string(),
                    value: raw,
                    expected: "three comma-separated numbers",
                };
                warn!("{e}; keeping current value");
                None
            }
            Err(e) => {
                warn!("{e}; keeping current value");
                None
            }
        }
    }
}

fn parse_value<T: FromStr>(
    name: &str,
    raw: &str,
    expected: &'static str,
) -> Result<T, ConfigParseError> {
    raw.trim().parse::<T>().map_err(|_| ConfigParseError {
        name: name.to_string(),
        value: raw.to_string(),
        expected,
    })
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, ConfigParseError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigParseError {
            name: name.to_string(),
            value: raw.to_string(),
            expected: "a boolean",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut cfg = Config::default();
        cfg.apply_overrides(|name| vars.get(name).cloned());
        cfg.sanitize()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.eviction.w_hits, 3.0);
        assert_eq!(cfg.eviction.cost_thresholds_ms, [5.0, 15.0, 40.0]);
        assert_eq!(cfg.ttl.window_size, 120);
        assert_eq!(cfg.refresh.top_n, 10);
        assert!(cfg.backend.url.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"cache": {"capacity": 7}}"#).unwrap();
        assert_eq!(cfg.cache.capacity, 7);
        assert_eq!(cfg.cache.build_retries, 2);
        assert_eq!(cfg.ttl.base_secs, 600);
    }

    #[test]
    fn test_env_overrides_apply() {
        let cfg = overlay(&[
            ("PREVIEW_CACHE_CAPACITY", "32"),
            ("PREVIEW_CACHE_W_AGE", "0.5"),
            ("PREVIEW_CACHE_COST_THRESHOLDS", "1, 2, 3"),
            ("PREVIEW_CACHE_BG_REFRESH", "off"),
            ("PREVIEW_CACHE_BACKEND_URL", "memory://"),
        ]);
        assert_eq!(cfg.cache.capacity, 32);
        assert_eq!(cfg.eviction.w_age, 0.5);
        assert_eq!(cfg.eviction.cost_thresholds_ms, [1.0, 2.0, 3.0]);
        assert!(!cfg.refresh.enabled);
        assert_eq!(cfg.backend.url.as_deref(), Some("memory://"));
    }

    #[test]
    fn test_unparseable_env_keeps_default() {
        let cfg = overlay(&[
            ("PREVIEW_CACHE_CAPACITY", "lots"),
            ("PREVIEW_CACHE_W_HITS", "NaN"),
            ("PREVIEW_CACHE_COST_THRESHOLDS", "5,15"),
            ("PREVIEW_CACHE_BG_REFRESH", "maybe"),
        ]);
        assert_eq!(cfg.cache.capacity, 400);
        assert_eq!(cfg.eviction.w_hits, 3.0);
        assert_eq!(cfg.eviction.cost_thresholds_ms, [5.0, 15.0, 40.0]);
        assert!(cfg.refresh.enabled);
    }

    #[test]
    fn test_sanitize_rejects_inverted_ttl_bounds() {
        let cfg = overlay(&[("PREVIEW_CACHE_TTL_MIN", "5000")]);
        assert_eq!(cfg.ttl.min_secs, 300);
        assert_eq!(cfg.ttl.max_secs, 1800);
    }

    #[test]
    fn test_parse_flag_error_names_variable() {
        let err = parse_flag("PREVIEW_CACHE_BG_REFRESH", "sometimes").unwrap_err();
        assert!(err.to_string().contains("PREVIEW_CACHE_BG_REFRESH"));
    }
}
