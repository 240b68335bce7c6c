//! Integration tests for the adaptive TTL controller.

use std::time::{Duration, Instant};

use preview_cache::cache::ttl::TtlController;
use preview_cache::config::TtlConfig;

fn feed(ctrl: &mut TtlController, misses: usize, hits: usize) {
    for _ in 0..misses {
        ctrl.record_request_hit(false);
    }
    for _ in 0..hits {
        ctrl.record_request_hit(true);
    }
}

#[test]
fn test_ttl_follows_hit_ratio() {
    let config = TtlConfig {
        window_size: 80,
        ..Default::default()
    };
    let mut ctrl = TtlController::new(config);
    let t0 = Instant::now();
    let initial = ctrl.ttl_secs();

    feed(&mut ctrl, 72, 8);
    let down = ctrl.maybe_adapt(t0).expect("enough samples");
    assert!(down.current_secs < initial || down.current_secs == ctrl.config().min_secs);
    assert!((down.hit_ratio - 0.1).abs() < 1e-9);

    feed(&mut ctrl, 8, 72);
    let t1 = t0 + Duration::from_secs(ctrl.config().adapt_interval_secs);
    let up = ctrl.maybe_adapt(t1).expect("interval elapsed");
    assert!(up.current_secs > down.current_secs || up.current_secs == ctrl.config().max_secs);
    assert!(up.current_secs >= down.current_secs);
}

#[test]
fn test_ttl_stays_within_bounds() {
    let config = TtlConfig {
        base_secs: 400,
        min_secs: 300,
        max_secs: 500,
        window_size: 10,
        ..Default::default()
    };
    let interval = Duration::from_secs(config.adapt_interval_secs);
    let mut ctrl = TtlController::new(config);
    let mut now = Instant::now();

    for _ in 0..20 {
        feed(&mut ctrl, 10, 0);
        ctrl.maybe_adapt(now);
        now += interval;
        assert!((300..=500).contains(&ctrl.ttl_secs()));
    }
    assert_eq!(ctrl.ttl_secs(), 300);

    for _ in 0..20 {
        feed(&mut ctrl, 0, 10);
        ctrl.maybe_adapt(now);
        now += interval;
        assert!((300..=500).contains(&ctrl.ttl_secs()));
    }
    assert_eq!(ctrl.ttl_secs(), 500);
}

#[test]
fn test_adaptation_is_rate_limited() {
    let mut ctrl = TtlController::new(TtlConfig::default());
    let t0 = Instant::now();
    feed(&mut ctrl, 120, 0);

    assert!(ctrl.maybe_adapt(t0).is_some());
    let after_first = ctrl.ttl_secs();
    for s in 0..30 {
        assert!(ctrl.maybe_adapt(t0 + Duration::from_secs(s)).is_none());
    }
    assert_eq!(ctrl.ttl_secs(), after_first);
    assert_eq!(ctrl.adaptations(), 1);
}

#[test]
fn test_middle_band_converges_to_base() {
    let mut ctrl = TtlController::new(TtlConfig::default());
    let mut now = Instant::now();

    // Drive the TTL up first.
    for _ in 0..5 {
        feed(&mut ctrl, 0, 120);
        ctrl.maybe_adapt(now);
        now += Duration::from_secs(30);
    }
    assert!(ctrl.ttl_secs() > 600);

    // A hit ratio of 0.4 walks it back to base and holds it there.
    for _ in 0..40 {
        feed(&mut ctrl, 72, 48);
        ctrl.maybe_adapt(now);
        now += Duration::from_secs(30);
    }
    assert_eq!(ctrl.ttl_secs(), 600);
}
