//! Pool counters and the export success moving average.
//!
//! Counters are monotonic atomics; readers get approximate but
//! tear-free values without any locking. The moving average is built
//! from periodic cumulative snapshots kept for a 30-minute window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Window covered by the moving success average.
pub const MOVING_AVERAGE_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Cumulative snapshot used for window arithmetic.
struct WindowSample {
    at: Instant,
    performed: u64,
    dropped: u64,
}

/// Monotonic export counters plus the sampled success window.
#[derive(Default)]
pub struct PoolStats {
    attempted: AtomicU64,
    performed: AtomicU64,
    dropped: AtomicU64,
    from_svg: AtomicU64,
    from_options: AtomicU64,
    time_spent_total_ms: AtomicU64,
    samples: Mutex<VecDeque<WindowSample>>,
}

impl PoolStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted export attempt.
    pub fn record_attempt(&self, from_svg: bool) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        if from_svg {
            self.from_svg.fetch_add(1, Ordering::Relaxed);
        } else {
            self.from_options.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a completed export and the time it took.
    pub fn record_success(&self, elapsed: Duration) {
        self.performed.fetch_add(1, Ordering::Relaxed);
        self.time_spent_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Count a failed export.
    pub fn record_failure(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Mean export duration in milliseconds over the process lifetime.
    #[must_use]
    pub fn average_export_time_ms(&self) -> f64 {
        let performed = self.performed();
        if performed == 0 {
            return 0.0;
        }
        self.time_spent_total_ms.load(Ordering::Relaxed) as f64 / performed as f64
    }

    /// Push one cumulative snapshot and trim the window. Driven by the
    /// registered sampler task.
    pub fn sample(&self) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        let now = Instant::now();
        samples.push_back(WindowSample {
            at: now,
            performed: self.performed(),
            dropped: self.dropped(),
        });
        while let Some(oldest) = samples.front() {
            if now.duration_since(oldest.at) > MOVING_AVERAGE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Success ratio over the sampled window; 1.0 when nothing ran.
    #[must_use]
    pub fn moving_average(&self) -> f64 {
        let Ok(samples) = self.samples.lock() else {
            return 1.0;
        };
        let Some(oldest) = samples.front() else {
            return 1.0;
        };
        let performed = self.performed().saturating_sub(oldest.performed);
        let dropped = self.dropped().saturating_sub(oldest.dropped);
        let total = performed + dropped;
        if total == 0 {
            return 1.0;
        }
        performed as f64 / total as f64
    }

    /// Serializable snapshot for the health endpoint.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempted_exports: self.attempted(),
            performed_exports: self.performed(),
            failed_exports: self.dropped(),
            from_svg: self.from_svg.load(Ordering::Relaxed),
            from_options: self.from_options.load(Ordering::Relaxed),
            average_export_time: self.average_export_time_ms(),
            moving_average: self.moving_average(),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub attempted_exports: u64,
    pub performed_exports: u64,
    pub failed_exports: u64,
    pub from_svg: u64,
    pub from_options: u64,
    pub average_export_time: f64,
    pub moving_average: f64,
}
