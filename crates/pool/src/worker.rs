//! A single rendering slot: one isolated browser page plus bookkeeping.
//!
//! State transitions are compare-and-swap on an atomic, so the reaper
//! and a concurrent release cannot both win the same transition.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::page::Page;

/// Lifecycle states of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Parked in the pool, ready to be acquired.
    Idle = 0,
    /// Exclusively owned by one in-flight job.
    Busy = 1,
    /// Retired, waiting for asynchronous destruction.
    Draining = 2,
    /// Killed by the reaper or a browser crash; never acquired again.
    Dead = 3,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Busy,
            2 => Self::Draining,
            _ => Self::Dead,
        }
    }
}

/// A pooled browser page with its usage counters.
pub struct Worker {
    id: u64,
    created_at: Instant,
    /// Pool epoch used as the zero point for busy/idle stamps.
    epoch: Instant,
    page: Page,
    /// Browser generation the page belongs to; pages of a crashed
    /// browser generation are unusable.
    generation: u64,
    state: AtomicU8,
    performed: AtomicU32,
    /// Milliseconds since `epoch` when the current job started, offset
    /// by one so zero can mean "not busy".
    busy_since_ms: AtomicU64,
    /// Same encoding for the most recent return to idle.
    idle_since_ms: AtomicU64,
}

impl Worker {
    pub(crate) fn new(id: u64, epoch: Instant, page: Page, generation: u64) -> Self {
        let worker = Self {
            id,
            created_at: Instant::now(),
            epoch,
            page,
            generation,
            state: AtomicU8::new(WorkerState::Idle as u8),
            performed: AtomicU32::new(0),
            busy_since_ms: AtomicU64::new(0),
            idle_since_ms: AtomicU64::new(0),
        };
        worker.stamp_idle();
        worker
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Exports served since creation.
    #[must_use]
    pub fn performed_count(&self) -> u32 {
        self.performed.load(Ordering::Relaxed)
    }

    /// Count one served export; returns the new total.
    pub(crate) fn record_performed(&self) -> u32 {
        self.performed.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle → Busy; stamps the job start on success.
    pub(crate) fn try_mark_busy(&self) -> bool {
        if self.transition(WorkerState::Idle, WorkerState::Busy) {
            self.stamp_busy();
            return true;
        }
        false
    }

    /// Busy → Idle; stamps the idle time on success.
    pub(crate) fn try_mark_idle(&self) -> bool {
        if self.transition(WorkerState::Busy, WorkerState::Idle) {
            self.busy_since_ms.store(0, Ordering::Release);
            self.stamp_idle();
            return true;
        }
        false
    }

    /// Busy or Idle → Draining for ordinary recycling.
    pub(crate) fn try_mark_draining(&self) -> bool {
        self.transition(WorkerState::Busy, WorkerState::Draining)
            || self.transition(WorkerState::Idle, WorkerState::Draining)
    }

    /// Busy → Dead; the reaper's transition.
    pub(crate) fn try_mark_dead_from_busy(&self) -> bool {
        self.transition(WorkerState::Busy, WorkerState::Dead)
    }

    /// Forced kill from any state; used when the browser crashed.
    pub(crate) fn mark_dead(&self) {
        self.state.store(WorkerState::Dead as u8, Ordering::Release);
    }

    /// Restart the busy clock without a state change; used when a
    /// worker is handed straight from one job to the next waiter.
    pub(crate) fn stamp_busy(&self) {
        self.busy_since_ms
            .store(self.stamp_now(), Ordering::Release);
    }

    fn stamp_idle(&self) {
        self.idle_since_ms
            .store(self.stamp_now(), Ordering::Release);
    }

    fn stamp_now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// How long the current job has been running, if any.
    #[must_use]
    pub fn busy_elapsed(&self) -> Option<Duration> {
        let stamp = self.busy_since_ms.load(Ordering::Acquire);
        if stamp == 0 {
            return None;
        }
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        Some(Duration::from_millis(now.saturating_sub(stamp)))
    }

    /// How long the worker has been parked since its last job.
    #[must_use]
    pub fn idle_elapsed(&self) -> Duration {
        let stamp = self.idle_since_ms.load(Ordering::Acquire);
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        Duration::from_millis(now.saturating_sub(stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // State transitions are exercised without a live page through the
    // pool integration tests; here we pin down the CAS semantics that
    // the reaper/release race relies on.

    #[test]
    fn state_round_trip() {
        assert_eq!(WorkerState::from_u8(0), WorkerState::Idle);
        assert_eq!(WorkerState::from_u8(1), WorkerState::Busy);
        assert_eq!(WorkerState::from_u8(2), WorkerState::Draining);
        assert_eq!(WorkerState::from_u8(3), WorkerState::Dead);
        assert_eq!(WorkerState::from_u8(200), WorkerState::Dead);
    }
}
