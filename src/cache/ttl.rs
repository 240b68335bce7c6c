//! Adaptive TTL: a closed loop from observed hit ratio to cache lifetime.
//!
//! Every request pushes a hit/miss sample into a bounded window. Once the
//! window is at least half full, `maybe_adapt` moves the TTL by a banded
//! step, at most once per adaptation interval:
//!
//! | hit ratio                        | change                         |
//! |----------------------------------|--------------------------------|
//! | `< low_critical`                 | shrink by `shrink_step`        |
//! | `low_critical ..< low_moderate`  | move `converge_step` to base   |
//! | `low_moderate ..< high_grow`     | grow by `grow_step`            |
//! | `>= high_grow`                   | grow by `strong_grow_step`     |
//!
//! The result is always clamped to `[min, max]`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::TtlConfig;

/// Fixed-capacity FIFO of hit (true) / miss (false) samples.
#[derive(Debug, Clone)]
pub struct RecentHitWindow {
    samples: VecDeque<bool>,
    capacity: usize,
    hits: usize,
}

impl RecentHitWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
        }
    }

    pub fn push(&mut self, hit: bool) {
        if self.samples.len() == self.capacity {
            if let Some(true) = self.samples.pop_front() {
                self.hits -= 1;
            }
        }
        self.samples.push_back(hit);
        if hit {
            self.hits += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Fraction of hits among the retained samples, or `None` when empty.
    pub fn hit_ratio(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.hits as f64 / self.samples.len() as f64)
        }
    }
}

/// One applied adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TtlAdjustment {
    pub previous_secs: u64,
    pub current_secs: u64,
    pub hit_ratio: f64,
}

/// Owns the process-wide TTL value.
#[derive(Debug, Clone)]
pub struct TtlController {
    config: TtlConfig,
    ttl_secs: u64,
    window: RecentHitWindow,
    last_adapted: Option<Instant>,
    last_adjustment: Option<TtlAdjustment>,
    adaptations: u64,
}

impl TtlController {
    pub fn new(config: TtlConfig) -> Self {
        let ttl_secs = config
            .base_secs
            .clamp(config.min_secs, config.max_secs.max(config.min_secs));
        let window = RecentHitWindow::new(config.window_size);
        Self {
            config,
            ttl_secs,
            window,
            last_adapted: None,
            last_adjustment: None,
            adaptations: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    pub fn window(&self) -> &RecentHitWindow {
        &self.window
    }

    pub fn last_adjustment(&self) -> Option<&TtlAdjustment> {
        self.last_adjustment.as_ref()
    }

    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }

    pub fn record_request_hit(&mut self, hit: bool) {
        self.window.push(hit);
    }

    /// Samples required before the controller will act.
    pub fn min_samples(&self) -> usize {
        (self.window.capacity() / 2).max(1)
    }

    /// Recompute the TTL if enough samples exist and the interval has
    /// elapsed since the previous adaptation.
    pub fn maybe_adapt(&mut self, now: Instant) -> Option<TtlAdjustment> {
        if self.window.len() < self.min_samples() {
            return None;
        }
        let interval = Duration::from_secs(self.config.adapt_interval_secs);
        if let Some(last) = self.last_adapted {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        let hit_ratio = self.window.hit_ratio()?;

        let previous = self.ttl_secs;
        let next = self.next_ttl(previous, hit_ratio);
        self.ttl_secs = next;
        self.last_adapted = Some(now);
        self.adaptations += 1;

        let adjustment = TtlAdjustment {
            previous_secs: previous,
            current_secs: next,
            hit_ratio,
        };
        self.last_adjustment = Some(adjustment);
        Some(adjustment)
    }

    fn next_ttl(&self, ttl: u64, hit_ratio: f64) -> u64 {
        let c = &self.config;
        let next = if hit_ratio < c.low_critical {
            ttl.saturating_sub(c.shrink_step_secs)
        } else if hit_ratio < c.low_moderate {
            if ttl > c.base_secs {
                ttl.saturating_sub(c.converge_step_secs).max(c.base_secs)
            } else {
                ttl.saturating_add(c.converge_step_secs).min(c.base_secs)
            }
        } else if hit_ratio < c.high_grow {
            ttl.saturating_add(c.grow_step_secs)
        } else {
            ttl.saturating_add(c.strong_grow_step_secs)
        };
        next.clamp(c.min_secs, c.max_secs.max(c.min_secs))
    }
}
