//! Cache keys, entries and the payload contract.
//!
//! An entry is the unit of eviction: it is created from one successful
//! build, touched on every fresh hit, and removed whole by the eviction
//! policy or a full bust.

use std::fmt;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Anything the builder produces and the cache stores.
///
/// The cache treats payloads as opaque. `curated_ratio` lets per-key stats
/// report how much of a preview came from hand-picked examples versus
/// sampling; payloads without that notion keep the default.
pub trait CachePayload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn curated_ratio(&self) -> Option<f64> {
        None
    }
}

/// Identifies one preview request shape.
///
/// The catalog tag changes whenever the catalog is reloaded, so entries
/// built from an older catalog can never be served for new requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Theme being previewed.
    pub theme: String,

    /// Maximum number of items in the preview.
    pub limit: usize,

    /// Optional color identity filter (e.g. "WU").
    pub colors: Option<String>,

    /// Optional commander to bias the sample toward.
    pub commander: Option<String>,

    /// Catalog version the preview was built against.
    pub catalog_tag: String,
}

impl CacheKey {
    pub fn new(theme: impl Into<String>, limit: usize, catalog_tag: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            limit,
            colors: None,
            commander: None,
            catalog_tag: catalog_tag.into(),
        }
    }

    pub fn with_colors(mut self, colors: impl Into<String>) -> Self {
        self.colors = Some(colors.into());
        self
    }

    pub fn with_commander(mut self, commander: impl Into<String>) -> Self {
        self.commander = Some(commander.into());
        self
    }

    /// Stable string form used by the write-through backend.
    pub fn storage_key(&self) -> String {
        format!(
            "preview:{}:{}:{}:{}:{}",
            self.theme,
            self.limit,
            self.colors.as_deref().unwrap_or("-"),
            self.commander.as_deref().unwrap_or("-"),
            self.catalog_tag
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.theme, self.limit)?;
        if let Some(colors) = &self.colors {
            write!(f, "/colors={colors}")?;
        }
        if let Some(commander) = &self.commander {
            write!(f, "/commander={commander}")?;
        }
        write!(f, "@{}", self.catalog_tag)
    }
}

/// Access bookkeeping of an entry, the only part that feeds scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryMeta {
    /// When the payload was stored.
    pub inserted_at: Instant,

    /// Last fresh hit (equals `inserted_at` until the first hit).
    pub last_access: Instant,

    /// Number of fresh hits served.
    pub hit_count: u64,

    /// How long the builder took to produce the payload.
    pub build_cost_ms: f64,

    /// Store-wide insertion sequence, used to break ties deterministically.
    pub seq: u64,
}

impl EntryMeta {
    pub fn new(now: Instant, build_cost_ms: f64, seq: u64) -> Self {
        Self {
            inserted_at: now,
            last_access: now,
            hit_count: 0,
            build_cost_ms: if build_cost_ms.is_finite() { build_cost_ms.max(0.0) } else { 0.0 },
            seq,
        }
    }

    /// Seconds since insertion; zero if the clock reading is older than the entry.
    pub fn age_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.inserted_at).as_secs_f64()
    }
}

/// A stored payload plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<P> {
    payload: P,
    meta: EntryMeta,
}

impl<P> CacheEntry<P> {
    pub(crate) fn new(payload: P, meta: EntryMeta) -> Self {
        Self { payload, meta }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    /// Whether the entry is younger than `ttl` at `now`.
    pub fn is_fresh(&self, ttl: std::time::Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.meta.inserted_at) < ttl
    }

    /// Record a fresh hit.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.meta.last_access = now.max(self.meta.inserted_at);
        self.meta.hit_count = self.meta.hit_count.saturating_add(1);
    }
}
