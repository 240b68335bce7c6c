//! Protection score: how strongly an entry should be kept.
//!
//! ```text
//! score = w_hits    × ln(1 + hit_count)
//!       + w_recency × 1 / (1 + minutes_since_access)
//!       + w_cost    × cost_bucket(build_cost_ms)
//!       - w_age     × minutes_since_insert
//! ```
//!
//! Higher is more protected. The eviction policy removes the lowest.

use std::time::Instant;

use crate::cache::entry::EntryMeta;
use crate::config::EvictionConfig;

/// Scores entries with weights resolved once from configuration.
#[derive(Debug, Clone)]
pub struct ProtectionScorer {
    config: EvictionConfig,
}

impl ProtectionScorer {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Step function over the configured thresholds: 0 below the first,
    /// 3 at or above the last.
    pub fn cost_bucket(&self, build_cost_ms: f64) -> u8 {
        let [t1, t2, t3] = self.config.cost_thresholds_ms;
        if build_cost_ms >= t3 {
            3
        } else if build_cost_ms >= t2 {
            2
        } else if build_cost_ms >= t1 {
            1
        } else {
            0
        }
    }

    pub fn score(&self, meta: &EntryMeta, now: Instant) -> f64 {
        let minutes_since_access = now.saturating_duration_since(meta.last_access).as_secs_f64() / 60.0;
        let minutes_since_insert = now.saturating_duration_since(meta.inserted_at).as_secs_f64() / 60.0;

        let recency_term = 1.0 / (1.0 + minutes_since_access);
        let cost_bucket = f64::from(self.cost_bucket(meta.build_cost_ms));

        self.config.w_hits * (meta.hit_count as f64).ln_1p()
            + self.config.w_recency * recency_term
            + self.config.w_cost * cost_bucket
            - self.config.w_age * minutes_since_insert
    }
}

impl Default for ProtectionScorer {
    fn default() -> Self {
        Self::new(EvictionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meta_at(now: Instant, hits: u64, cost_ms: f64) -> EntryMeta {
        let mut meta = EntryMeta::new(now, cost_ms, 0);
        meta.hit_count = hits;
        meta
    }

    #[test]
    fn test_cost_bucket_boundaries() {
        let scorer = ProtectionScorer::default();
        assert_eq!(scorer.cost_bucket(0.0), 0);
        assert_eq!(scorer.cost_bucket(4.99), 0);
        assert_eq!(scorer.cost_bucket(5.0), 1);
        assert_eq!(scorer.cost_bucket(14.9), 1);
        assert_eq!(scorer.cost_bucket(15.0), 2);
        assert_eq!(scorer.cost_bucket(39.9), 2);
        assert_eq!(scorer.cost_bucket(40.0), 3);
        assert_eq!(scorer.cost_bucket(4000.0), 3);
    }

    #[test]
    fn test_fresh_cold_entry_scores_recency_only() {
        let scorer = ProtectionScorer::default();
        let now = Instant::now();
        let score = scorer.score(&meta_at(now, 0, 0.0), now);
        // w_recency × 1/(1+0)
        assert!((score - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_expensive_entries_are_protected() {
        let scorer = ProtectionScorer::default();
        let now = Instant::now();
        let cheap = scorer.score(&meta_at(now, 1, 1.0), now);
        let costly = scorer.score(&meta_at(now, 1, 100.0), now);
        assert!((costly - cheap - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_future_timestamps_saturate() {
        let scorer = ProtectionScorer::default();
        let now = Instant::now();
        let later = now + Duration::from_secs(600);
        let meta = meta_at(later, 0, 0.0);
        assert!((scorer.score(&meta, now) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_age_penalty_per_minute() {
        let scorer = ProtectionScorer::default();
        let t0 = Instant::now();
        let meta = meta_at(t0, 0, 0.0);
        let later = t0 + Duration::from_secs(120);
        // 2 minutes old, never accessed: 2×1/3 − 1.5×2
        let expected = 2.0 / 3.0 - 3.0;
        assert!((scorer.score(&meta, later) - expected).abs() < 1e-9);
    }
}
