//! Adaptive preview cache.
//!
//! This module contains the cache data structures and algorithms:
//! - [`entry`]: CacheKey, EntryMeta, CacheEntry
//! - [`scorer`]: Protection score (hits + recency + build cost + age)
//! - [`evictor`]: Eviction policy (low score / emergency overflow)
//! - [`store`]: Bounded key/value map with capacity enforcement
//! - [`ttl`]: Hit-ratio driven TTL controller
//! - [`metrics`]: Counters, latency windows and snapshots
//! - [`refresher`]: Background rebuild of hot keys
//! - [`backend`]: Optional write-through secondary store
//! - [`service`]: The `get_or_build` orchestrator

pub mod backend;
pub mod entry;
pub mod evictor;
pub mod metrics;
pub mod refresher;
pub mod scorer;
pub mod service;
pub mod store;
pub mod ttl;

pub use entry::{CacheKey, CachePayload};
pub use service::{BuildError, Lookup, LookupSource, PreviewBuilder, PreviewCache};
