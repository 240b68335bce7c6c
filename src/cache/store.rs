//! Keyed entry table.
//!
//! The store owns every entry, runs the eviction policy after each put and
//! remembers the last full bust. It does not expire entries on its own:
//! freshness is decided per request against the current TTL.
//!
//! The store is not synchronized; the cache service keeps it behind the
//! single state lock.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::cache::entry::{CacheEntry, CacheKey, EntryMeta};
use crate::cache::evictor::{EvictionPolicy, EvictionRecord};

/// When and why the store was last wiped.
#[derive(Debug, Clone)]
pub struct BustInfo {
    pub at: SystemTime,
    pub reason: String,
    pub removed: usize,
}

pub struct CacheStore<P> {
    entries: HashMap<CacheKey, CacheEntry<P>>,
    capacity: usize,
    policy: EvictionPolicy,
    next_seq: u64,
    last_bust: Option<BustInfo>,
}

impl<P: Clone> CacheStore<P> {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(4096) + 1),
            capacity,
            policy,
            next_seq: 0,
            last_bust: None,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry<P>> {
        self.entries.get(key)
    }

    /// Return a copy of the payload and record a hit if the entry is
    /// younger than `ttl`. Stale entries are left in place for eviction.
    pub fn get_fresh(&mut self, key: &CacheKey, ttl: Duration, now: Instant) -> Option<P> {
        let entry = self.entries.get_mut(key)?;
        if !entry.is_fresh(ttl, now) {
            return None;
        }
        entry.touch(now);
        Some(entry.payload().clone())
    }

    /// Record a hit on an existing entry. Returns false if it is gone.
    pub fn touch(&mut self, key: &CacheKey, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now);
                true
            }
            None => false,
        }
    }

    /// Insert or overwrite, then enforce capacity.
    pub fn put(
        &mut self,
        key: CacheKey,
        payload: P,
        build_cost_ms: f64,
        now: Instant,
    ) -> Vec<EvictionRecord> {
        self.insert(key, payload, build_cost_ms, now);
        self.enforce_capacity(now)
    }

    /// Insert a burst of entries and enforce capacity once at the end.
    ///
    /// Used for pre-warming; this is the one path where the store can
    /// grow past twice its capacity and trigger emergency overflow.
    pub fn put_batch<I>(&mut self, items: I, now: Instant) -> Vec<EvictionRecord>
    where
        I: IntoIterator<Item = (CacheKey, P, f64)>,
    {
        for (key, payload, cost) in items {
            self.insert(key, payload, cost, now);
        }
        self.enforce_capacity(now)
    }

    fn insert(&mut self, key: CacheKey, payload: P, build_cost_ms: f64, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(key, CacheEntry::new(payload, EntryMeta::new(now, build_cost_ms, seq)));
    }

    fn enforce_capacity(&mut self, now: Instant) -> Vec<EvictionRecord> {
        let size = self.entries.len();
        let victims = self.policy.select_victims(
            self.entries.iter().map(|(k, e)| (k, e.meta())),
            size,
            self.capacity,
            now,
        );

        let mut records = Vec::with_capacity(victims.len());
        for victim in victims {
            let size_before = self.entries.len();
            let Some(entry) = self.entries.remove(&victim.key) else {
                continue;
            };
            let meta = entry.meta();
            debug!(
                key = %victim.key,
                reason = %victim.reason,
                hits = meta.hit_count,
                score = victim.score,
                "Evicted preview"
            );
            records.push(EvictionRecord {
                key: victim.key,
                reason: victim.reason,
                hit_count: meta.hit_count,
                age_secs: meta.age_secs(now),
                build_cost_ms: meta.build_cost_ms,
                score: victim.score,
                size_before,
                size_after: self.entries.len(),
                capacity: self.capacity,
            });
        }
        records
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&mut self, reason: &str) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.last_bust = Some(BustInfo {
            at: SystemTime::now(),
            reason: reason.to_string(),
            removed,
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_bust(&self) -> Option<&BustInfo> {
        self.last_bust.as_ref()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }
}
