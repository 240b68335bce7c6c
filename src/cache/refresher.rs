//! Background refresher: rebuilds the most-requested keys before they go
//! stale.
//!
//! One task per cache, started lazily on the first build. Each cycle sleeps
//! an adaptive interval, then rebuilds the top-N keys by request count.
//! Individual failures are logged and skipped so one bad key cannot stall
//! the loop. The task holds only a weak reference and exits when the cache
//! is dropped or the refresher is disabled; on exit it clears the started
//! flag so `refresher_started` reports a live task.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::entry::CachePayload;
use crate::cache::metrics::BuildOrigin;
use crate::cache::service::{elapsed_ms, PreviewCache};
use crate::config::RefreshConfig;

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub attempted: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Sleep before the next cycle.
///
/// Slow builds stretch the base interval proportionally to how far p95
/// exceeds `slow_p95_ms`, up to `max_stretch`. A build error rate above
/// `high_error_rate` multiplies by `error_shrink`. The result is bounded
/// to `[min_interval, 5 × base]`.
pub fn next_refresh_interval(config: &RefreshConfig, p95_build_ms: f64, error_rate: f64) -> Duration {
    let base = config.base_interval_secs as f64;
    let mut secs = base;

    if config.slow_p95_ms > 0.0 && p95_build_ms > config.slow_p95_ms {
        let overshoot = ((p95_build_ms - config.slow_p95_ms) / config.slow_p95_ms).min(1.0);
        secs *= 1.0 + (config.max_stretch - 1.0) * overshoot;
    }
    if error_rate > config.high_error_rate {
        secs *= config.error_shrink;
    }

    if !secs.is_finite() {
        secs = base;
    }

    let upper = base * 5.0;
    let lower = (config.min_interval_secs as f64).min(upper);
    Duration::from_secs_f64(secs.clamp(lower, upper))
}

impl<P: CachePayload> PreviewCache<P> {
    /// Run one refresh cycle over the most-requested keys.
    ///
    /// Keys evicted or overwritten meanwhile are simply re-inserted.
    pub async fn refresh_hot_keys(&self) -> RefreshReport {
        let top_n = self.refresh_config().top_n;
        let keys = self.with_state(|s| s.metrics.top_requested(top_n)).await;

        let mut report = RefreshReport::default();
        for key in keys {
            report.attempted += 1;
            let started = Instant::now();
            match self.builder().build(&key).await {
                Ok(payload) => {
                    let ms = elapsed_ms(started);
                    self.store_built(key, &payload, ms, BuildOrigin::Refresh).await;
                    report.refreshed += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Background refresh failed");
                    self.record_build_failure(&key).await;
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn plan_next_cycle(&self) -> Duration {
        let config = self.refresh_config().clone();
        self.with_state(|s| {
            let interval =
                next_refresh_interval(&config, s.metrics.build_p95_ms(), s.metrics.build_error_rate());
            s.metrics.set_refresh_interval(interval);
            interval
        })
        .await
    }

    async fn finish_cycle(&self, next: Duration) {
        self.with_state(|s| s.metrics.record_refresh_cycle(next)).await;
    }
}

/// The refresher loop.
pub(crate) async fn run<P: CachePayload>(cache: Weak<PreviewCache<P>>, stop: Arc<Notify>) {
    loop {
        let interval = match cache.upgrade() {
            Some(c) if c.refresher_enabled() => c.plan_next_cycle().await,
            _ => break,
        };
        debug!(secs = interval.as_secs_f64(), "Refresher sleeping");

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.notified() => {}
        }

        let Some(c) = cache.upgrade() else { break };
        if !c.refresher_enabled() {
            break;
        }
        let report = c.refresh_hot_keys().await;
        let next = c.plan_next_cycle().await;
        c.finish_cycle(next).await;
        debug!(
            attempted = report.attempted,
            refreshed = report.refreshed,
            failed = report.failed,
            "Refresh cycle complete"
        );
    }
    if let Some(c) = cache.upgrade() {
        c.refresher_exited();
    }
    info!("Background refresher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_interval_when_healthy() {
        let config = RefreshConfig::default();
        assert_eq!(next_refresh_interval(&config, 10.0, 0.0), Duration::from_secs(120));
    }

    #[test]
    fn test_slow_builds_stretch_up_to_cap() {
        let config = RefreshConfig::default();
        // p95 at 1.5× the slow threshold: half the maximum stretch.
        let half = next_refresh_interval(&config, 60.0, 0.0);
        assert!((half.as_secs_f64() - 120.0 * 1.375).abs() < 1e-6);

        let capped = next_refresh_interval(&config, 10_000.0, 0.0);
        assert!((capped.as_secs_f64() - 120.0 * 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_errors_shrink_interval() {
        let config = RefreshConfig::default();
        let d = next_refresh_interval(&config, 0.0, 0.5);
        assert!((d.as_secs_f64() - 72.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_factors_fall_back_to_base() {
        let config = RefreshConfig {
            max_stretch: f64::NAN,
            error_shrink: f64::INFINITY,
            ..RefreshConfig::default()
        };
        assert_eq!(next_refresh_interval(&config, 10_000.0, 0.0), Duration::from_secs(120));
        assert_eq!(next_refresh_interval(&config, 0.0, 1.0), Duration::from_secs(120));
    }

    #[test]
    fn test_interval_lower_bound() {
        let config = RefreshConfig {
            base_interval_secs: 40,
            ..RefreshConfig::default()
        };
        // 40 × 0.6 = 24, clamped up to 30.
        assert_eq!(next_refresh_interval(&config, 0.0, 1.0), Duration::from_secs(30));
    }
}
