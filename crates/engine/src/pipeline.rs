//! The per-request export pipeline.
//!
//! Classify, gate, short-circuit, acquire, load, measure, set the
//! viewport, rasterize, release. Every browser interaction is bounded
//! by the remaining rasterization budget so a hung page can never pin a
//! worker past its deadline.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, PrintToPdfParams, Viewport,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use log::debug;
use serde::Deserialize;
use tokio::time::{sleep, timeout};

use browser_pool::{ReleaseOutcome, WorkerLease, WorkerPool};
use bundle_cache::BundleCache;
use export_core::config::ExportConfig;
use export_core::request::RequestKind;
use export_core::{Artifact, ExportError, ExportResult, OutputFormat, RenderRequest};

use crate::policy;
use crate::template;

/// Poll period for the page-side render completion flag.
const RENDER_POLL: Duration = Duration::from_millis(10);
/// CSS pixels per inch, for PDF paper sizing.
const CSS_PIXELS_PER_INCH: f64 = 96.0;
/// Aspect-ratio guard: heights beyond this multiple of the width are
/// clamped to `width * CLAMPED_HEIGHT_FACTOR`.
const HEIGHT_RATIO_LIMIT: f64 = 1.25;
const CLAMPED_HEIGHT_FACTOR: f64 = 0.7;

/// Execute one export end to end.
pub(crate) async fn run(
    pool: &WorkerPool,
    cache: &BundleCache,
    config: &ExportConfig,
    benchmarking: bool,
    request: &RenderRequest,
) -> ExportResult<Artifact> {
    let kind = request.kind()?;
    policy::enforce(config, request)?;
    request.validate()?;

    // An inline SVG document asked back as SVG is returned verbatim.
    if kind == RequestKind::InlineSvg && request.output_format == OutputFormat::Svg {
        let document = request.svg_document.clone().unwrap_or_default();
        return Ok(Artifact::new(
            document.into_bytes(),
            OutputFormat::Svg,
            request.request_id.clone(),
        ));
    }

    let stats = pool.stats();
    stats.record_attempt(kind == RequestKind::InlineSvg);
    let started = Instant::now();

    let lease = match pool.acquire().await {
        Ok(lease) => lease,
        Err(err) => {
            stats.record_failure();
            return Err(err);
        }
    };
    let worker_id = lease.worker_id();

    let mut result = drive_page(&lease, cache, config, request, kind)
        .await
        .map(|bytes| Artifact::new(bytes, request.output_format, request.request_id.clone()));
    // A worker the reaper killed mid-job always reports a timeout, no
    // matter which browser call happened to fail first.
    if lease.is_dead()
        && let Err(err) = &result
        && !matches!(err, ExportError::RenderTimeout(_))
    {
        result = Err(ExportError::RenderTimeout(
            config.rasterization_timeout_ms,
        ));
    }
    match &result {
        Ok(_artifact) => {
            pool.release(lease, ReleaseOutcome::Ok);
            let elapsed = started.elapsed();
            stats.record_success(elapsed);
            if benchmarking {
                debug!(
                    "export {} finished on worker {worker_id} in {}ms",
                    request.request_id,
                    elapsed.as_millis()
                );
            }
        }
        Err(err) => {
            let outcome = if err.recycles_worker() || lease.is_dead() {
                ReleaseOutcome::Fault
            } else {
                ReleaseOutcome::Ok
            };
            pool.release(lease, outcome);
            stats.record_failure();
        }
    }
    result
}

/// The on-page half of the pipeline, from content load to bytes.
async fn drive_page(
    lease: &WorkerLease,
    cache: &BundleCache,
    config: &ExportConfig,
    request: &RenderRequest,
    kind: RequestKind,
) -> ExportResult<Vec<u8>> {
    let page = lease.page();
    let deadline = Deadline::new(config.rasterization_timeout());

    let html = match kind {
        RequestKind::ChartConfig => {
            let bundle = cache.get().ok_or_else(|| {
                ExportError::RasterizeFailed("charting bundle is not initialized".to_owned())
            })?;
            template::render_page(&bundle, request)
        }
        RequestKind::InlineSvg => {
            template::svg_page(request.svg_document.as_deref().unwrap_or_default())
        }
    };

    bounded(&deadline, "content load", page.set_content(html)).await?;
    wait_render_complete(page, &deadline).await?;

    let rect = measure(page, &deadline).await?;
    set_viewport(page, &deadline, &rect, request.effective_scale()).await?;
    let bytes = rasterize(page, &deadline, request.output_format, &rect).await?;

    if kind == RequestKind::ChartConfig
        && let Err(err) = page.evaluate(template::reset_script()).await
    {
        debug!("post-export page reset failed: {err}");
    }
    Ok(bytes)
}

/// Remaining-budget tracking for one export's render phase.
struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.budget.checked_sub(self.started.elapsed())
    }

    fn timeout_error(&self) -> ExportError {
        ExportError::RenderTimeout(self.budget.as_millis() as u64)
    }
}

/// Run one browser call inside the remaining budget.
async fn bounded<T>(
    deadline: &Deadline,
    what: &str,
    operation: impl Future<Output = Result<T, CdpError>>,
) -> ExportResult<T> {
    let Some(remaining) = deadline.remaining() else {
        return Err(deadline.timeout_error());
    };
    match timeout(remaining, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ExportError::RasterizeFailed(format!("{what} failed: {err}"))),
        Err(_elapsed) => Err(deadline.timeout_error()),
    }
}

/// Poll the page-side completion flag at 10ms until it flips or the
/// budget runs out.
async fn wait_render_complete(page: &Page, deadline: &Deadline) -> ExportResult<()> {
    loop {
        let evaluation = bounded(
            deadline,
            "render poll",
            page.evaluate("window.isRenderComplete === true"),
        )
        .await?;
        if evaluation.into_value::<bool>().unwrap_or(false) {
            return Ok(());
        }
        if deadline.remaining().is_none() {
            return Err(deadline.timeout_error());
        }
        sleep(RENDER_POLL).await;
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DomRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

const MEASURE_SCRIPT: &str = r"(function () {
  var el = document.querySelector('#chart-container');
  if (!el) { return null; }
  var rect = el.getBoundingClientRect();
  return { x: rect.x, y: rect.y, width: rect.width, height: rect.height };
})()";

const SVG_EXTRACT_SCRIPT: &str = r"(function () {
  if (window.__chart && typeof window.__chart.getSVG === 'function') {
    return window.__chart.getSVG();
  }
  var svg = document.querySelector('#container svg') || document.querySelector('#chart-container svg');
  return svg ? svg.outerHTML : null;
})()";

/// Measure `#chart-container` and apply the aspect-ratio guard.
async fn measure(page: &Page, deadline: &Deadline) -> ExportResult<DomRect> {
    let evaluation = bounded(deadline, "measurement", page.evaluate(MEASURE_SCRIPT)).await?;
    let rect: Option<DomRect> = evaluation.into_value().unwrap_or(None);
    let rect = rect.ok_or_else(|| {
        ExportError::RasterizeFailed("chart container missing from rendered page".to_owned())
    })?;
    Ok(effective_rect(rect))
}

/// Truncate dimensions and clamp pathological aspect ratios so a
/// runaway chart cannot produce an enormous artifact.
fn effective_rect(rect: DomRect) -> DomRect {
    let width = rect.width.max(1.0);
    let height = if rect.height > HEIGHT_RATIO_LIMIT * width {
        width * CLAMPED_HEIGHT_FACTOR
    } else {
        rect.height.max(1.0)
    };
    DomRect {
        x: rect.x,
        y: rect.y,
        width: width.trunc(),
        height: height.trunc().max(1.0),
    }
}

/// Size the viewport to the measured chart with the requested device
/// pixel ratio.
async fn set_viewport(
    page: &Page,
    deadline: &Deadline,
    rect: &DomRect,
    scale: f64,
) -> ExportResult<()> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(rect.width as i64)
        .height(rect.height as i64)
        .device_scale_factor(scale)
        .mobile(false)
        .build()
        .map_err(|err| ExportError::RasterizeFailed(format!("viewport params rejected: {err}")))?;
    bounded(deadline, "viewport override", page.execute(params)).await?;
    Ok(())
}

/// Capture the measured region in the requested format.
async fn rasterize(
    page: &Page,
    deadline: &Deadline,
    format: OutputFormat,
    rect: &DomRect,
) -> ExportResult<Vec<u8>> {
    match format {
        OutputFormat::Png | OutputFormat::Jpeg => screenshot(page, deadline, rect, format).await,
        OutputFormat::Pdf => print_pdf(page, deadline, rect).await,
        OutputFormat::Svg => extract_svg(page, deadline).await,
    }
}

async fn screenshot(
    page: &Page,
    deadline: &Deadline,
    rect: &DomRect,
    format: OutputFormat,
) -> ExportResult<Vec<u8>> {
    let clip = Viewport {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        scale: 1.0,
    };
    let jpeg = format == OutputFormat::Jpeg;
    let capture_format = if jpeg {
        CaptureScreenshotFormat::Jpeg
    } else {
        CaptureScreenshotFormat::Png
    };
    let mut builder = CaptureScreenshotParams::builder()
        .format(capture_format)
        .clip(clip)
        .from_surface(true)
        .capture_beyond_viewport(true);
    if jpeg {
        builder = builder.quality(90);
    }
    let response = bounded(deadline, "screenshot", page.execute(builder.build())).await?;
    let encoded: &str = response.data.as_ref();
    BASE64_STANDARD
        .decode(encoded)
        .map_err(|err| ExportError::OutputEncodeFailed(format!("screenshot decode failed: {err}")))
}

async fn print_pdf(page: &Page, deadline: &Deadline, rect: &DomRect) -> ExportResult<Vec<u8>> {
    let params = PrintToPdfParams::builder()
        .print_background(true)
        .prefer_css_page_size(false)
        .paper_width(rect.width / CSS_PIXELS_PER_INCH)
        .paper_height(rect.height / CSS_PIXELS_PER_INCH)
        .margin_top(0.0)
        .margin_bottom(0.0)
        .margin_left(0.0)
        .margin_right(0.0)
        .build();
    bounded(deadline, "pdf print", page.pdf(params)).await
}

async fn extract_svg(page: &Page, deadline: &Deadline) -> ExportResult<Vec<u8>> {
    let evaluation = bounded(deadline, "svg extraction", page.evaluate(SVG_EXTRACT_SCRIPT)).await?;
    let document: Option<String> = evaluation.into_value().unwrap_or(None);
    document.map(String::into_bytes).ok_or_else(|| {
        ExportError::RasterizeFailed("page produced no svg document".to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(width: f64, height: f64) -> DomRect {
        DomRect {
            x: 0.0,
            y: 0.0,
            width,
            height,
        }
    }

    #[test]
    fn sane_aspect_ratios_pass_through() {
        let out = effective_rect(rect(600.0, 400.0));
        assert!((out.width - 600.0).abs() < f64::EPSILON);
        assert!((out.height - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pathological_height_is_clamped() {
        // 600 wide, 2000 tall: beyond 1.25x, so height becomes 600 * 0.7.
        let out = effective_rect(rect(600.0, 2000.0));
        assert!((out.height - 420.0).abs() < f64::EPSILON);
    }

    #[test]
    fn boundary_ratio_is_not_clamped() {
        let out = effective_rect(rect(400.0, 500.0));
        assert!((out.height - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dimensions_are_truncated() {
        let out = effective_rect(rect(600.7, 399.9));
        assert!((out.width - 600.0).abs() < f64::EPSILON);
        assert!((out.height - 399.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_sized_rect_is_floored() {
        let out = effective_rect(rect(0.0, 0.0));
        assert!(out.width >= 1.0);
        assert!(out.height >= 1.0);
    }

    #[tokio::test]
    async fn expired_deadline_reports_render_timeout() {
        let deadline = Deadline::new(Duration::from_millis(0));
        sleep(Duration::from_millis(2)).await;
        let result = bounded(&deadline, "noop", async { Ok::<_, CdpError>(()) }).await;
        assert!(matches!(result, Err(ExportError::RenderTimeout(0))));
    }

    mod without_browser {
        use super::super::*;
        use std::sync::Arc;

        use browser_pool::{PageInitializer, WorkerPool};
        use bundle_cache::BundleCache;
        use export_core::config::{ExportConfig, HighchartsConfig, PoolConfig};

        struct NoopSetup;

        impl PageInitializer for NoopSetup {
            fn initialize<'a>(
                &'a self,
                _page: &'a Page,
            ) -> std::pin::Pin<Box<dyn Future<Output = ExportResult<()>> + Send + 'a>> {
                Box::pin(async { Ok(()) })
            }
        }

        fn idle_pool() -> WorkerPool {
            WorkerPool::new(
                PoolConfig::default(),
                Duration::from_millis(1500),
                Arc::new(NoopSetup),
            )
        }

        #[tokio::test]
        async fn inline_svg_to_svg_echoes_verbatim() -> ExportResult<()> {
            let document = "<svg xmlns='http://www.w3.org/2000/svg'/>".to_owned();
            let request = RenderRequest {
                svg_document: Some(document.clone()),
                output_format: OutputFormat::Svg,
                ..RenderRequest::default()
            };
            // The echo path never touches the browser, so an empty pool
            // and an uninitialized cache are enough.
            let pool = idle_pool();
            let cache = BundleCache::new(HighchartsConfig::default());
            let artifact = run(&pool, &cache, &ExportConfig::default(), false, &request).await?;
            assert_eq!(artifact.bytes, document.into_bytes());
            assert_eq!(artifact.mime, "image/svg+xml");
            Ok(())
        }

        #[tokio::test]
        async fn policy_gate_fires_before_any_browser_work() {
            let request = RenderRequest {
                chart_options: Some(serde_json::json!({})),
                custom_code: Some("while (true) {}".to_owned()),
                ..RenderRequest::default()
            };
            let pool = idle_pool();
            let cache = BundleCache::new(HighchartsConfig::default());
            let result = run(&pool, &cache, &ExportConfig::default(), false, &request).await;
            assert!(matches!(result, Err(ExportError::CodeExecutionForbidden)));
        }

        #[tokio::test]
        async fn empty_request_is_config_invalid() {
            let pool = idle_pool();
            let cache = BundleCache::new(HighchartsConfig::default());
            let result = run(
                &pool,
                &cache,
                &ExportConfig::default(),
                false,
                &RenderRequest::default(),
            )
            .await;
            assert!(matches!(result, Err(ExportError::ConfigInvalid(_))));
        }
    }
}
