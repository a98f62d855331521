//! Browser worker pool.
//!
//! One headless Chromium process, supervised; a bounded set of
//! long-lived pages treated as expendable workers; FIFO admission with
//! queue-depth backpressure; per-worker work limits; and a reaper for
//! hung or stale workers.

pub mod pool;
pub mod reaper;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use pool::{PageInitializer, PoolSnapshot, ReleaseOutcome, WorkerLease, WorkerPool};
pub use reaper::{spawn_reaper, spawn_stats_sampler};
pub use stats::{PoolStats, StatsSnapshot};
pub use supervisor::{Supervisor, SupervisorStatus};
pub use worker::{Worker, WorkerState};
