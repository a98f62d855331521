//! Bounded dispatch of render jobs onto reusable page workers.
//!
//! Admission control lives here: idle reuse first, then growth up to
//! `max`, then a bounded FIFO wait queue, then fail-fast rejection.
//! Membership changes happen under one short-lived mutex; the mutex is
//! never held across an await point.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chromiumoxide::page::Page;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use export_core::config::PoolConfig;
use export_core::{ExportError, ExportResult};

use crate::stats::PoolStats;
use crate::supervisor::{Supervisor, SupervisorStatus};
use crate::worker::{Worker, WorkerState};

/// Creation attempts per worker before the failure surfaces.
const CREATE_ATTEMPTS: u32 = 3;
/// Poll period while shutdown drains in-flight jobs.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Prepares a fresh page for rendering work.
///
/// The pool owns page lifecycles but knows nothing about charts; the
/// engine supplies the setup (installing the cached library bundle and
/// neutralizing animations) through this seam.
pub trait PageInitializer: Send + Sync {
    fn initialize<'a>(
        &'a self,
        page: &'a Page,
    ) -> Pin<Box<dyn Future<Output = ExportResult<()>> + Send + 'a>>;
}

/// How a job ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Export finished; the worker may be reused.
    Ok,
    /// Page-level fault; the worker must be recycled.
    Fault,
}

/// Exclusive handle to an acquired worker.
///
/// Dropping the lease without an explicit release counts as a fault,
/// so cancelled jobs always recycle their page.
pub struct WorkerLease {
    worker: Arc<Worker>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl WorkerLease {
    fn new(worker: Arc<Worker>, pool: Arc<PoolInner>) -> Self {
        Self {
            worker,
            pool,
            released: false,
        }
    }

    /// The leased page.
    #[must_use]
    pub fn page(&self) -> &Page {
        self.worker.page()
    }

    /// Identifier of the leased worker, for logs.
    #[must_use]
    pub fn worker_id(&self) -> u64 {
        self.worker.id()
    }

    /// Whether the reaper killed this worker mid-job.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.worker.state() == WorkerState::Dead
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.released {
            let worker = Arc::clone(&self.worker);
            let pool = Arc::clone(&self.pool);
            pool.release_worker(&worker, ReleaseOutcome::Fault);
        }
    }
}

/// The bounded worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    rasterization_timeout: Duration,
    pub(crate) supervisor: Supervisor,
    initializer: Arc<dyn PageInitializer>,
    membership: Mutex<Membership>,
    pub(crate) stats: Arc<PoolStats>,
    shutting_down: AtomicBool,
    next_worker_id: AtomicU64,
    epoch: Instant,
}

struct Membership {
    idle: VecDeque<Arc<Worker>>,
    all: Vec<Arc<Worker>>,
    /// Live workers plus reserved creation slots; `≤ config.max`.
    current: usize,
    waiters: VecDeque<oneshot::Sender<WorkerLease>>,
}

/// Serializable pool occupancy for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub current: usize,
    pub max: usize,
    pub waiting: usize,
    pub running: usize,
}

impl WorkerPool {
    /// Build an empty pool. Workers appear on [`Self::init`].
    #[must_use]
    pub fn new(
        config: PoolConfig,
        rasterization_timeout: Duration,
        initializer: Arc<dyn PageInitializer>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                rasterization_timeout,
                supervisor: Supervisor::new(),
                initializer,
                membership: Mutex::new(Membership {
                    idle: VecDeque::new(),
                    all: Vec::new(),
                    current: 0,
                    waiters: VecDeque::new(),
                }),
                stats: Arc::new(PoolStats::new()),
                shutting_down: AtomicBool::new(false),
                next_worker_id: AtomicU64::new(1),
                epoch: Instant::now(),
            }),
        }
    }

    /// Start the browser and bring up the minimum worker count.
    pub async fn init(&self) -> ExportResult<()> {
        let inner = &self.inner;
        inner
            .supervisor
            .start()
            .await
            .map_err(|err| ExportError::PoolInitFailed(err.to_string()))?;

        let wanted = inner.config.min;
        inner.with_membership(|members| members.current += wanted);

        let creations = (0..wanted).map(|_slot| inner.create_worker());
        let results = join_all(creations).await;

        let mut live = 0usize;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(worker) => {
                    live += 1;
                    inner.with_membership(|members| {
                        members.all.push(Arc::clone(&worker));
                        members.idle.push_back(worker);
                    });
                }
                Err(err) => {
                    inner.with_membership(|members| members.current -= 1);
                    first_error.get_or_insert(err);
                }
            }
        }

        if live < wanted {
            let reason = first_error
                .map_or_else(|| "unknown creation failure".to_owned(), |err| err.to_string());
            return Err(ExportError::PoolInitFailed(format!(
                "only {live} of {wanted} workers came up: {reason}"
            )));
        }
        info!("worker pool ready with {live} workers");
        Ok(())
    }

    /// Acquire a worker, waiting FIFO behind earlier callers when the
    /// pool is saturated.
    pub async fn acquire(&self) -> ExportResult<WorkerLease> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }

        enum Admission {
            Reuse(Arc<Worker>),
            Grow,
            Wait(oneshot::Receiver<WorkerLease>),
        }

        let admission = inner.with_membership(|members| {
            while let Some(worker) = members.idle.pop_front() {
                if worker.try_mark_busy() {
                    return Ok(Admission::Reuse(worker));
                }
                // Stray drained/dead entry; it is no longer acquirable.
            }
            if members.current < inner.config.max {
                members.current += 1;
                return Ok(Admission::Grow);
            }
            if members.waiters.len() >= inner.config.queue_size {
                return Err(ExportError::QueueOverflow);
            }
            let (sender, receiver) = oneshot::channel();
            members.waiters.push_back(sender);
            Ok(Admission::Wait(receiver))
        })?;

        match admission {
            Admission::Reuse(worker) => {
                debug!("reusing worker {}", worker.id());
                Ok(WorkerLease::new(worker, Arc::clone(inner)))
            }
            Admission::Grow => match inner.create_worker().await {
                Ok(worker) => {
                    worker.try_mark_busy();
                    inner.with_membership(|members| members.all.push(Arc::clone(&worker)));
                    debug!("grew pool with worker {}", worker.id());
                    Ok(WorkerLease::new(worker, Arc::clone(inner)))
                }
                Err(err) => {
                    inner.with_membership(|members| members.current -= 1);
                    Err(err)
                }
            },
            Admission::Wait(receiver) => {
                match timeout(inner.config.acquire_timeout(), receiver).await {
                    Ok(Ok(lease)) => Ok(lease),
                    Ok(Err(_closed)) => Err(ExportError::Shutdown),
                    Err(_elapsed) => {
                        Err(ExportError::AcquireTimeout(inner.config.acquire_timeout_ms))
                    }
                }
            }
        }
    }

    /// Return a worker after a job.
    pub fn release(&self, mut lease: WorkerLease, outcome: ReleaseOutcome) {
        lease.released = true;
        let worker = Arc::clone(&lease.worker);
        drop(lease);
        self.inner.release_worker(&worker, outcome);
    }

    /// Stop admissions, drain in-flight work, destroy all workers and
    /// stop the browser.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("worker pool shutting down");

        inner.with_membership(|members| {
            // Dropping the senders fails pending acquisitions with Shutdown.
            members.waiters.clear();
            members.idle.clear();
        });

        let deadline = Instant::now() + inner.config.destroy_timeout();
        loop {
            let busy = inner.with_membership(|members| {
                members
                    .all
                    .iter()
                    .filter(|worker| worker.state() == WorkerState::Busy)
                    .count()
            });
            if busy == 0 || Instant::now() >= deadline {
                if busy > 0 {
                    warn!("shutdown proceeding with {busy} jobs still in flight");
                }
                break;
            }
            sleep(DRAIN_POLL).await;
        }

        let workers = inner.with_membership(|members| {
            members.current = 0;
            std::mem::take(&mut members.all)
        });
        let closes = workers.into_iter().map(|worker| {
            let destroy_timeout = inner.config.destroy_timeout();
            async move {
                worker.mark_dead();
                let page = worker.page().clone();
                if timeout(destroy_timeout, page.close()).await.is_err() {
                    debug!("worker {} page close timed out", worker.id());
                }
            }
        });
        join_all(closes).await;

        inner.supervisor.stop().await;
        info!("worker pool stopped");
    }

    /// Occupancy counters for the health endpoint.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = &self.inner;
        inner.with_membership(|members| PoolSnapshot {
            current: members.current,
            max: inner.config.max,
            waiting: members.waiters.len(),
            running: members
                .all
                .iter()
                .filter(|worker| worker.state() == WorkerState::Busy)
                .count(),
        })
    }

    /// Shared export counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.inner.stats)
    }

    /// The render-phase deadline the reaper enforces.
    #[must_use]
    pub fn rasterization_timeout(&self) -> Duration {
        self.inner.rasterization_timeout
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

impl PoolInner {
    fn with_membership<T>(&self, operate: impl FnOnce(&mut Membership) -> T) -> T {
        // The membership mutex is never poisoned: no callback panics.
        let mut guard = match self.membership.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        operate(&mut guard)
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create one worker: page, then chart setup, with bounded retry.
    async fn create_worker(self: &Arc<Self>) -> ExportResult<Arc<Worker>> {
        let mut last_error = ExportError::BrowserUnavailable("no attempt made".to_owned());
        for attempt in 1..=CREATE_ATTEMPTS {
            match timeout(self.config.create_timeout(), self.try_create()).await {
                Ok(Ok(worker)) => return Ok(worker),
                Ok(Err(err)) => {
                    warn!("worker creation failed (attempt {attempt}/{CREATE_ATTEMPTS}): {err}");
                    last_error = err;
                }
                Err(_elapsed) => {
                    warn!(
                        "worker creation timed out after {}ms (attempt {attempt}/{CREATE_ATTEMPTS})",
                        self.config.create_timeout_ms
                    );
                    last_error = ExportError::BrowserUnavailable(format!(
                        "worker creation timed out after {}ms",
                        self.config.create_timeout_ms
                    ));
                }
            }
            if attempt < CREATE_ATTEMPTS {
                sleep(self.config.create_retry_interval()).await;
            }
        }
        Err(last_error)
    }

    async fn try_create(self: &Arc<Self>) -> ExportResult<Arc<Worker>> {
        let page = self.supervisor.new_page().await?;
        self.initializer.initialize(&page).await?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Worker::new(
            id,
            self.epoch,
            page,
            self.supervisor.generation(),
        )))
    }

    /// Synchronous half of release; destruction is spawned.
    pub(crate) fn release_worker(self: &Arc<Self>, worker: &Arc<Worker>, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::Ok {
            let next = worker.record_performed();
            if next < self.config.work_limit && self.try_requeue(worker) {
                return;
            }
            if next >= self.config.work_limit {
                debug!(
                    "worker {} reached its work limit of {}",
                    worker.id(),
                    self.config.work_limit
                );
            }
        }
        self.recycle(worker);
    }

    /// Hand a still-busy worker to the oldest live waiter, or park it.
    /// Returns false when the worker cannot be reused (reaped mid-job).
    fn try_requeue(self: &Arc<Self>, worker: &Arc<Worker>) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        loop {
            enum Handoff {
                Sent,
                Parked,
                Retry(WorkerLease),
                Unusable,
            }
            let step = self.with_membership(|members| {
                if worker.state() != WorkerState::Busy {
                    // The reaper marked it Dead while the job finished.
                    return Handoff::Unusable;
                }
                if let Some(waiter) = members.waiters.pop_front() {
                    worker.stamp_busy();
                    let lease = WorkerLease::new(Arc::clone(worker), Arc::clone(self));
                    return match waiter.send(lease) {
                        Ok(()) => Handoff::Sent,
                        // The waiter gave up; disarm the bounced lease
                        // and try the next one.
                        Err(mut bounced) => {
                            bounced.released = true;
                            Handoff::Retry(bounced)
                        }
                    };
                }
                if worker.try_mark_idle() {
                    members.idle.push_back(Arc::clone(worker));
                    Handoff::Parked
                } else {
                    Handoff::Unusable
                }
            });
            match step {
                Handoff::Sent | Handoff::Parked => return true,
                Handoff::Retry(bounced) => drop(bounced),
                Handoff::Unusable => return false,
            }
        }
    }

    /// Retire a worker: take it out of membership, destroy its page,
    /// and refill the pool if the floor or a waiter needs it.
    fn recycle(self: &Arc<Self>, worker: &Arc<Worker>) {
        if !worker.try_mark_dead_from_busy() {
            worker.try_mark_draining();
        }
        let removed = self.with_membership(|members| {
            let before = members.all.len();
            members.all.retain(|member| member.id() != worker.id());
            members.idle.retain(|member| member.id() != worker.id());
            if members.all.len() < before {
                members.current -= 1;
                true
            } else {
                false
            }
        });

        let page = worker.page().clone();
        let destroy_timeout = self.config.destroy_timeout();
        let worker_id = worker.id();
        tokio::spawn(async move {
            if timeout(destroy_timeout, page.close()).await.is_err() {
                debug!("worker {worker_id} page close timed out");
            }
        });

        if removed {
            debug!("worker {worker_id} recycled");
            self.maybe_refill();
        }
    }

    /// Spawn replacement workers for the floor or for live waiters.
    pub(crate) fn maybe_refill(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let should_spawn = self.with_membership(|members| {
            let below_floor = members.current < self.config.min;
            let waiter_needs = !members.waiters.is_empty() && members.current < self.config.max;
            if below_floor || waiter_needs {
                members.current += 1;
                true
            } else {
                false
            }
        });
        if !should_spawn {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.create_worker().await {
                Ok(worker) => {
                    inner.with_membership(|members| members.all.push(Arc::clone(&worker)));
                    worker.try_mark_busy();
                    if !inner.try_requeue(&worker) {
                        inner.recycle(&worker);
                    }
                    // A replacement may reveal further deficit.
                    inner.maybe_refill();
                }
                Err(err) => {
                    inner.with_membership(|members| members.current -= 1);
                    warn!("pool refill failed: {err}");
                }
            }
        });
    }

    /// Kill every worker after a browser crash. Busy workers stay in
    /// membership until their jobs release them.
    pub(crate) fn fail_all_workers(self: &Arc<Self>) {
        let victims = self.with_membership(|members| {
            members.idle.clear();
            let mut gone = Vec::new();
            members.all.retain(|worker| {
                worker.mark_dead();
                if worker.busy_elapsed().is_some() {
                    true
                } else {
                    gone.push(Arc::clone(worker));
                    members.current -= 1;
                    false
                }
            });
            gone
        });
        if !victims.is_empty() {
            warn!("{} workers invalidated by browser crash", victims.len());
        }
    }

    /// Reaper tick: kill over-deadline busy workers, evict stale idle
    /// workers above the floor, and recover from browser crashes.
    pub(crate) fn reap_once(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        if self.supervisor.status() == SupervisorStatus::Crashed {
            self.fail_all_workers();
            self.maybe_refill();
            return;
        }

        let workers = self.with_membership(|members| members.all.clone());
        for worker in &workers {
            let over_deadline = worker
                .busy_elapsed()
                .is_some_and(|elapsed| elapsed > self.rasterization_timeout);
            if over_deadline && worker.try_mark_dead_from_busy() {
                warn!(
                    "reaper killed worker {} after {}ms",
                    worker.id(),
                    self.rasterization_timeout.as_millis()
                );
                // Closing the page makes the hung job's pending browser
                // call fail, which surfaces RenderTimeout upstream.
                let page = worker.page().clone();
                tokio::spawn(async move {
                    let _closed = page.close().await;
                });
            }
        }

        // Idle eviction, oldest first, never below the floor.
        loop {
            let evicted = self.with_membership(|members| {
                if members.current <= self.config.min {
                    return None;
                }
                let front_expired = members
                    .idle
                    .front()
                    .is_some_and(|worker| worker.idle_elapsed() > self.config.idle_timeout());
                if !front_expired {
                    return None;
                }
                members.idle.pop_front()
            });
            match evicted {
                Some(worker) => {
                    if worker.try_mark_draining() {
                        debug!("evicting idle worker {}", worker.id());
                        self.recycle(&worker);
                    }
                }
                None => break,
            }
        }
    }
}
