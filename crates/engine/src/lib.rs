//! The export engine and its public orchestrator.
//!
//! [`Exporter`] is the surface the HTTP layer and the CLI drive: bring
//! the service up (`init_export`), run single or batched exports, swap
//! the charting-library version, and shut everything down in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{info, warn};

use browser_pool::{PoolSnapshot, StatsSnapshot, WorkerPool, spawn_reaper, spawn_stats_sampler};
use bundle_cache::BundleCache;
use export_core::{Artifact, Config, ExportError, ExportResult, RenderRequest, TimerRegistry};

pub mod batch;
pub mod pipeline;
pub mod policy;
pub mod setup;
pub mod template;

pub use batch::{BatchOutcome, BatchPair, parse_batch};
pub use setup::ChartPageSetup;

/// The assembled export service: cache, pool, and periodic tasks.
pub struct Exporter {
    config: Config,
    cache: Arc<BundleCache>,
    pool: WorkerPool,
    timers: TimerRegistry,
    started_at: Instant,
}

impl Exporter {
    /// Bring the service up: publish the bundle, start the browser,
    /// create the minimum worker set, and start periodic maintenance.
    ///
    /// A bundle download failure here is fatal by design; the caller
    /// exits nonzero instead of serving requests it cannot satisfy.
    pub async fn init_export(config: Config) -> ExportResult<Self> {
        config.validate()?;

        let cache = Arc::new(BundleCache::new(config.highcharts.clone()));
        cache.init().await?;

        let initializer = Arc::new(ChartPageSetup::new(Arc::clone(&cache)));
        let pool = WorkerPool::new(
            config.pool.clone(),
            config.export.rasterization_timeout(),
            initializer,
        );
        pool.init().await?;

        let timers = TimerRegistry::new();
        spawn_reaper(&pool, &timers);
        spawn_stats_sampler(&pool, &timers);

        info!(
            "export service ready (library {}, {} workers)",
            cache.version().unwrap_or_else(|| "unknown".to_owned()),
            config.pool.min
        );
        Ok(Self {
            config,
            cache,
            pool,
            timers,
            started_at: Instant::now(),
        })
    }

    /// Run one export end to end.
    pub async fn export(&self, request: RenderRequest) -> ExportResult<Artifact> {
        pipeline::run(
            &self.pool,
            &self.cache,
            &self.config.export,
            self.config.pool.benchmarking,
            &request,
        )
        .await
    }

    /// Fan a `input=output;...` batch out as concurrent exports.
    ///
    /// The returned list reports every pair; the batch as a whole
    /// succeeded only when every entry did.
    pub async fn batch_export(&self, spec: &str) -> ExportResult<Vec<BatchOutcome>> {
        let pairs = batch::parse_batch(spec)?;
        let jobs = pairs.into_iter().map(|pair| async move {
            let result = self.run_pair(&pair).await;
            if let Err(err) = &result {
                warn!("batch entry {} failed: {err}", pair.input.display());
            }
            BatchOutcome { pair, result }
        });
        Ok(join_all(jobs).await)
    }

    async fn run_pair(&self, pair: &batch::BatchPair) -> ExportResult<()> {
        let options_text = tokio::fs::read_to_string(&pair.input).await.map_err(|err| {
            ExportError::ConfigInvalid(format!("cannot read {}: {err}", pair.input.display()))
        })?;
        let request = batch::pair_request(pair, &options_text)?;
        let artifact = self.export(request).await?;

        if let Some(parent) = pair.output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                ExportError::OutputEncodeFailed(format!(
                    "cannot create {}: {err}",
                    parent.display()
                ))
            })?;
        }
        tokio::fs::write(&pair.output, &artifact.bytes)
            .await
            .map_err(|err| {
                ExportError::OutputEncodeFailed(format!(
                    "cannot write {}: {err}",
                    pair.output.display()
                ))
            })
    }

    /// Switch the charting library to a different version. In-flight
    /// exports keep the bundle they started with.
    pub async fn update_version(&self, version: &str) -> ExportResult<String> {
        self.cache.update_version(version).await
    }

    /// Version tag of the live bundle.
    #[must_use]
    pub fn library_version(&self) -> Option<String> {
        self.cache.version()
    }

    /// Time since `init_export` completed.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Pool occupancy for the health surface.
    #[must_use]
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Export counters for the health surface.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.pool.stats().snapshot()
    }

    /// The resolved configuration the service runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Orderly shutdown: stop periodic tasks first, then drain and
    /// destroy the pool and the browser.
    pub async fn shutdown(&self) {
        info!("export service shutting down");
        self.timers.clear();
        self.pool.shutdown().await;
    }
}
