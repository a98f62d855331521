//! Pool behavior against a live headless Chromium.
//!
//! These cover the admission invariants that need real pages: FIFO
//! hand-off, work-limit recycling, growth bounded by `max`, and the
//! acquire timeout. Tests skip silently when no Chrome binary exists.

use std::path::Path;
use std::pin::Pin;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::page::Page;
use tokio::time::sleep;

use browser_pool::{PageInitializer, ReleaseOutcome, WorkerPool};
use export_core::config::PoolConfig;
use export_core::{ExportError, ExportResult};

struct NoopSetup;

impl PageInitializer for NoopSetup {
    fn initialize<'a>(
        &'a self,
        _page: &'a Page,
    ) -> Pin<Box<dyn Future<Output = ExportResult<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

fn chrome_available() -> bool {
    if let Ok(path) = std::env::var("CHROME_BIN")
        && Path::new(&path).exists()
    {
        return true;
    }
    ["google-chrome", "chromium", "chromium-browser", "chrome"]
        .iter()
        .any(|binary| {
            Command::new(binary)
                .arg("--version")
                .output()
                .is_ok_and(|output| output.status.success())
        })
}

fn pool_with(tune: impl FnOnce(&mut PoolConfig)) -> WorkerPool {
    let mut config = PoolConfig {
        min: 1,
        max: 1,
        ..PoolConfig::default()
    };
    tune(&mut config);
    WorkerPool::new(config, Duration::from_secs(5), Arc::new(NoopSetup))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_are_served_in_arrival_order() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.queue_size = 8;
        config.acquire_timeout_ms = 10_000;
    });
    pool.init().await?;

    let holder = pool.acquire().await?;

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut waiters = Vec::new();
    for index in 0..4u32 {
        let pool_handle = pool.clone();
        let order_handle = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            let lease = pool_handle.acquire().await?;
            let _send = order_handle.send(index);
            pool_handle.release(lease, ReleaseOutcome::Ok);
            Ok::<(), ExportError>(())
        }));
        // Serialize enqueue order.
        sleep(Duration::from_millis(100)).await;
    }

    pool.release(holder, ReleaseOutcome::Ok);
    for waiter in waiters {
        waiter.await??;
    }

    let mut served = Vec::new();
    while let Ok(index) = order_rx.try_recv() {
        served.push(index);
    }
    assert_eq!(served, vec![0, 1, 2, 3]);

    pool.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn work_limit_recycles_the_worker() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.work_limit = 2;
        config.acquire_timeout_ms = 10_000;
        config.queue_size = 4;
    });
    pool.init().await?;

    let mut seen_ids = Vec::new();
    for _round in 0..4 {
        let lease = pool.acquire().await?;
        seen_ids.push(lease.worker_id());
        pool.release(lease, ReleaseOutcome::Ok);
        // Recycling and refill are asynchronous.
        sleep(Duration::from_millis(300)).await;
    }

    // Two exports per worker, then a replacement takes over.
    assert_eq!(seen_ids[0], seen_ids[1]);
    assert_ne!(seen_ids[1], seen_ids[2]);
    assert_eq!(seen_ids[2], seen_ids[3]);

    pool.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn growth_never_exceeds_max() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.min = 1;
        config.max = 2;
        config.queue_size = 16;
        config.acquire_timeout_ms = 15_000;
    });
    pool.init().await?;

    let mut jobs = Vec::new();
    for _job in 0..6 {
        let pool_handle = pool.clone();
        jobs.push(tokio::spawn(async move {
            let lease = pool_handle.acquire().await?;
            sleep(Duration::from_millis(150)).await;
            pool_handle.release(lease, ReleaseOutcome::Ok);
            Ok::<usize, ExportError>(pool_handle.snapshot().current)
        }));
    }

    for job in jobs {
        let current = job.await??;
        assert!(current <= 2, "pool grew to {current} workers");
    }
    assert!(pool.snapshot().current <= 2);

    pool.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_times_out_waiters() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.queue_size = 4;
        config.acquire_timeout_ms = 300;
    });
    pool.init().await?;

    let holder = pool.acquire().await?;
    let result = pool.acquire().await;
    assert!(matches!(result, Err(ExportError::AcquireTimeout(300))));

    pool.release(holder, ReleaseOutcome::Ok);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_queue_rejects_immediately() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.queue_size = 0;
        config.acquire_timeout_ms = 5000;
    });
    pool.init().await?;

    let holder = pool.acquire().await?;
    let started = std::time::Instant::now();
    let result = pool.acquire().await;
    assert!(matches!(result, Err(ExportError::QueueOverflow)));
    // Fail-fast, not a timeout.
    assert!(started.elapsed() < Duration::from_millis(500));

    pool.release(holder, ReleaseOutcome::Ok);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_fails_pending_acquisitions() -> anyhow::Result<()> {
    if !chrome_available() {
        return Ok(());
    }
    let pool = pool_with(|config| {
        config.queue_size = 4;
        config.acquire_timeout_ms = 10_000;
        config.destroy_timeout_ms = 500;
    });
    pool.init().await?;

    let holder = pool.acquire().await?;
    let pool_handle = pool.clone();
    let waiter = tokio::spawn(async move { pool_handle.acquire().await });
    sleep(Duration::from_millis(200)).await;

    // The worker is still held, so the pending waiter must be failed
    // by shutdown rather than served.
    pool.shutdown().await;
    let result = waiter.await?;
    assert!(result.is_err());

    drop(holder);
    Ok(())
}
