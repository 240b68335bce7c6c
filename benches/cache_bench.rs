//! Benchmarks for the preview cache subsystem.

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use preview_cache::cache::entry::{CacheKey, EntryMeta};
use preview_cache::cache::evictor::EvictionPolicy;
use preview_cache::cache::scorer::ProtectionScorer;
use preview_cache::cache::store::CacheStore;
use preview_cache::cache::ttl::TtlController;
use preview_cache::config::TtlConfig;

fn bench_eviction_scoring(c: &mut Criterion) {
    let policy = EvictionPolicy::new(ProtectionScorer::default());
    let now = Instant::now() + Duration::from_secs(3600);

    // 10,000 entries with varied hits, cost and age.
    let entries: Vec<(CacheKey, EntryMeta)> = (0..10_000u64)
        .map(|i| {
            let inserted = now - Duration::from_secs(i % 3600);
            let mut meta = EntryMeta::new(inserted, (i % 60) as f64, i);
            meta.hit_count = i % 17;
            (CacheKey::new(format!("theme-{i}"), 12, "bench"), meta)
        })
        .collect();

    c.bench_function("low_score_select_from_10k", |b| {
        b.iter(|| {
            let victims = policy.select_victims(
                black_box(entries.iter().map(|(k, m)| (k, m))),
                10_000,
                9_999,
                now,
            );
            black_box(victims);
        })
    });

    c.bench_function("emergency_select_from_10k", |b| {
        b.iter(|| {
            let victims = policy.select_victims(
                black_box(entries.iter().map(|(k, m)| (k, m))),
                10_000,
                4_000,
                now,
            );
            black_box(victims);
        })
    });
}

fn bench_store_put_at_capacity(c: &mut Criterion) {
    let now = Instant::now();
    let mut store = CacheStore::new(400, EvictionPolicy::default());
    for i in 0..400 {
        store.put(CacheKey::new(format!("warm-{i}"), 12, "bench"), i, 5.0, now);
    }

    let mut n = 0usize;
    c.bench_function("store_put_at_capacity_400", |b| {
        b.iter(|| {
            n += 1;
            let records = store.put(CacheKey::new(format!("new-{n}"), 12, "bench"), n, 5.0, now);
            black_box(records);
        })
    });
}

fn bench_ttl_adaptation(c: &mut Criterion) {
    let mut ctrl = TtlController::new(TtlConfig {
        adapt_interval_secs: 0,
        ..Default::default()
    });
    let now = Instant::now();
    let mut i = 0u64;

    c.bench_function("ttl_record_and_adapt", |b| {
        b.iter(|| {
            i += 1;
            ctrl.record_request_hit(i % 3 != 0);
            black_box(ctrl.maybe_adapt(now));
        })
    });
}

criterion_group!(
    benches,
    bench_eviction_scoring,
    bench_store_put_at_capacity,
    bench_ttl_adaptation,
);
criterion_main!(benches);
