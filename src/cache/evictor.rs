//! Eviction policy: decides which entries leave the store after a put.
//!
//! - `size <= capacity`: nothing to do.
//! - `capacity < size <= 2 × capacity`: remove the single lowest protection
//!   score. One victim per put keeps insert cost bounded.
//! - `size > 2 × capacity`: emergency overflow, remove oldest-first until
//!   `size == capacity` without scoring.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::cache::entry::{CacheKey, EntryMeta};
use crate::cache::scorer::ProtectionScorer;

/// Why an entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Lowest protection score while between 1× and 2× capacity.
    LowScore,
    /// Oldest-first recovery after growing past 2× capacity.
    EmergencyOverflow,
}

impl EvictionReason {
    pub const ALL: [EvictionReason; 2] = [EvictionReason::LowScore, EvictionReason::EmergencyOverflow];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::LowScore => "low_score",
            EvictionReason::EmergencyOverflow => "emergency_overflow",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A victim chosen by the policy, not yet removed.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub reason: EvictionReason,
    pub score: f64,
}

/// A completed removal, as reported to metrics.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionRecord {
    pub key: CacheKey,
    pub reason: EvictionReason,
    pub hit_count: u64,
    pub age_secs: f64,
    pub build_cost_ms: f64,
    pub score: f64,
    pub size_before: usize,
    pub size_after: usize,
    pub capacity: usize,
}

// Max-heap ordering where the oldest insertion compares greatest.
struct OldestFirst<'a> {
    key: &'a CacheKey,
    meta: &'a EntryMeta,
}

impl OldestFirst<'_> {
    fn rank(&self) -> (Instant, u64) {
        (self.meta.inserted_at, self.meta.seq)
    }
}

impl PartialEq for OldestFirst<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for OldestFirst<'_> {}

impl PartialOrd for OldestFirst<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OldestFirst<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    scorer: ProtectionScorer,
}

impl EvictionPolicy {
    pub fn new(scorer: ProtectionScorer) -> Self {
        Self { scorer }
    }

    pub fn scorer(&self) -> &ProtectionScorer {
        &self.scorer
    }

    /// Pick the entries to remove given the current `size` and `capacity`.
    ///
    /// Ties on score go to the earliest insertion so the outcome does not
    /// depend on hash map iteration order.
    pub fn select_victims<'a, I>(
        &self,
        entries: I,
        size: usize,
        capacity: usize,
        now: Instant,
    ) -> Vec<EvictionCandidate>
    where
        I: Iterator<Item = (&'a CacheKey, &'a EntryMeta)>,
    {
        if size <= capacity {
            return Vec::new();
        }

        if size > capacity.saturating_mul(2) {
            let excess = size - capacity;
            let mut heap: BinaryHeap<OldestFirst<'a>> =
                entries.map(|(key, meta)| OldestFirst { key, meta }).collect();

            let mut victims = Vec::with_capacity(excess);
            while victims.len() < excess {
                let Some(oldest) = heap.pop() else { break };
                victims.push(EvictionCandidate {
                    key: oldest.key.clone(),
                    reason: EvictionReason::EmergencyOverflow,
                    score: self.scorer.score(oldest.meta, now),
                });
            }
            return victims;
        }

        entries
            .map(|(key, meta)| (key, meta, self.scorer.score(meta, now)))
            .min_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.1.seq.cmp(&b.1.seq))
            })
            .map(|(key, _, score)| EvictionCandidate {
                key: key.clone(),
                reason: EvictionReason::LowScore,
                score,
            })
            .into_iter()
            .collect()
    }
}
