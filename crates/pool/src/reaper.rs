//! Periodic pool maintenance tasks.
//!
//! The reaper enforces the rasterization deadline on busy workers and
//! evicts stale idle workers; the sampler feeds the moving success
//! average. Both are registered with the timer registry so shutdown
//! stops them in one place.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use export_core::TimerRegistry;

use crate::pool::WorkerPool;

/// Sampling period of the success moving average.
const SAMPLE_PERIOD: Duration = Duration::from_secs(60);

/// Start the reaper if it is enabled in the pool configuration.
pub fn spawn_reaper(pool: &WorkerPool, timers: &TimerRegistry) {
    let inner = Arc::clone(pool.inner());
    if !inner.config().reaper_enabled {
        return;
    }
    let period = inner.config().reaper_interval();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first tick fires immediately; skip it so a fresh pool is
        // not scanned before it finishes initializing.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            inner.reap_once();
        }
    });
    timers.register("pool-reaper", handle);
}

/// Start the stats sampler feeding the 30-minute success window.
pub fn spawn_stats_sampler(pool: &WorkerPool, timers: &TimerRegistry) {
    let stats = pool.stats();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(SAMPLE_PERIOD);
        loop {
            ticker.tick().await;
            stats.sample();
        }
    });
    timers.register("stats-sampler", handle);
}
