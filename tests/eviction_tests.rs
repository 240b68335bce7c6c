//! Integration tests for the eviction policy and the store's capacity
//! enforcement.

use std::time::{Duration, Instant};

use preview_cache::cache::entry::{CacheKey, EntryMeta};
use preview_cache::cache::evictor::{EvictionPolicy, EvictionReason};
use preview_cache::cache::scorer::ProtectionScorer;
use preview_cache::cache::store::CacheStore;
use preview_cache::config::EvictionConfig;

fn key(n: usize) -> CacheKey {
    CacheKey::new(format!("theme-{n}"), 12, "tag")
}

fn store(capacity: usize) -> CacheStore<String> {
    CacheStore::new(capacity, EvictionPolicy::default())
}

#[test]
fn test_low_score_eviction_at_capacity() {
    let mut store = store(5);
    let t0 = Instant::now();
    let mut records = Vec::new();

    for i in 0..6 {
        records.extend(store.put(key(i), format!("p{i}"), 2.0, t0 + Duration::from_secs(i as u64)));
    }

    assert_eq!(store.len(), 5);
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.reason == EvictionReason::LowScore));
    assert_eq!(records[0].size_before, 6);
    assert_eq!(records[0].size_after, 5);
}

#[test]
fn test_emergency_overflow_on_burst() {
    let mut store = store(4);
    let t0 = Instant::now();

    let burst = (0..9).map(|i| (key(i), format!("p{i}"), 1.0));
    let records = store.put_batch(burst, t0);

    assert!(store.len() <= 4);
    assert!(records
        .iter()
        .any(|r| r.reason == EvictionReason::EmergencyOverflow));

    // Oldest insertions go first.
    for i in 0..5 {
        assert!(!store.contains(&key(i)), "key {i} should have been evicted");
    }
    for i in 5..9 {
        assert!(store.contains(&key(i)), "key {i} should remain");
    }
}

#[test]
fn test_hot_entry_survives_cold_inserts() {
    let mut store = store(5);
    let t0 = Instant::now();

    let hot = key(0);
    store.put(hot.clone(), "hot".to_string(), 1.0, t0);
    for s in 1..=6 {
        assert!(store.touch(&hot, t0 + Duration::from_secs(s)));
    }

    // Six single-hit entries follow the hot one.
    let mut evicted = Vec::new();
    for i in 1..=6 {
        let now = t0 + Duration::from_secs(10 + i as u64);
        let records = store.put(key(i), format!("p{i}"), 1.0, now);
        evicted.extend(records.into_iter().map(|r| r.key));
        // A zero-hit insert may be its own put's victim.
        if store.contains(&key(i)) {
            store.touch(&key(i), now);
        }
    }

    assert_eq!(store.len(), 5);
    assert_eq!(evicted.len(), 2);
    assert!(!evicted.contains(&hot));
    assert_eq!(store.get(&hot).unwrap().meta().hit_count, 6);
    for i in 1..=6 {
        if let Some(entry) = store.get(&key(i)) {
            assert_eq!(entry.meta().hit_count, 1);
        }
    }
}

#[test]
fn test_capacity_holds_after_every_put() {
    let mut store = store(8);
    let t0 = Instant::now();
    for i in 0..200 {
        let now = t0 + Duration::from_millis(i as u64 * 250);
        store.put(key(i % 37), format!("p{i}"), (i % 50) as f64, now);
        if i % 3 == 0 {
            store.touch(&key(i % 11), now);
        }
        assert!(store.len() <= 8, "size {} after put {i}", store.len());
    }
}

#[test]
fn test_score_monotonic_in_hits() {
    let scorer = ProtectionScorer::default();
    let now = Instant::now();
    let mut prev = f64::NEG_INFINITY;
    for hits in 0..50 {
        let mut meta = EntryMeta::new(now, 10.0, 0);
        meta.hit_count = hits;
        let score = scorer.score(&meta, now);
        assert!(score > prev, "hits={hits}");
        prev = score;
    }
}

#[test]
fn test_score_monotonic_in_recency_and_cost() {
    let scorer = ProtectionScorer::default();
    let t0 = Instant::now();
    let now = t0 + Duration::from_secs(3600);

    // Same insertion, accessed progressively more recently.
    let mut prev = f64::NEG_INFINITY;
    for minutes in 0..=60 {
        let mut meta = EntryMeta::new(t0, 1.0, 0);
        meta.last_access = t0 + Duration::from_secs(minutes * 60);
        let score = scorer.score(&meta, now);
        assert!(score > prev, "accessed at minute {minutes}");
        prev = score;
    }

    // Costlier builds never score lower.
    let mut prev = f64::NEG_INFINITY;
    for cost in [0.0, 4.9, 5.0, 14.9, 15.0, 39.9, 40.0, 500.0] {
        let score = scorer.score(&EntryMeta::new(now, cost, 0), now);
        assert!(score >= prev, "cost={cost}");
        prev = score;
    }
}

#[test]
fn test_score_decreases_with_age() {
    let scorer = ProtectionScorer::default();
    let now = Instant::now() + Duration::from_secs(7200);
    let mut prev = f64::INFINITY;
    for minutes in 0..60 {
        let inserted = now - Duration::from_secs(minutes * 60);
        let mut meta = EntryMeta::new(inserted, 1.0, 0);
        meta.last_access = now;
        let score = scorer.score(&meta, now);
        assert!(score < prev, "age {minutes}m");
        prev = score;
    }
}

#[test]
fn test_weights_change_victim() {
    // With only the cost weight, the cheapest entry goes.
    let config = EvictionConfig {
        w_hits: 0.0,
        w_recency: 0.0,
        w_cost: 1.0,
        w_age: 0.0,
        ..Default::default()
    };
    let mut store: CacheStore<String> = CacheStore::new(2, EvictionPolicy::new(ProtectionScorer::new(config)));
    let t0 = Instant::now();
    store.put(key(0), "a".into(), 100.0, t0);
    store.put(key(1), "b".into(), 1.0, t0);
    let records = store.put(key(2), "c".into(), 20.0, t0);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, key(1));
}
