//! Worker page preparation.
//!
//! New pool workers are warmed with the static page shell so the
//! charting bundle is parsed once per worker instead of once per
//! export, and animations are neutral from the first job on.

use std::pin::Pin;
use std::sync::Arc;

use chromiumoxide::page::Page;
use log::debug;

use browser_pool::PageInitializer;
use bundle_cache::BundleCache;
use export_core::{ExportError, ExportResult};

use crate::template;

/// Installs the cached charting bundle into fresh worker pages.
pub struct ChartPageSetup {
    cache: Arc<BundleCache>,
}

impl ChartPageSetup {
    #[must_use]
    pub fn new(cache: Arc<BundleCache>) -> Self {
        Self { cache }
    }
}

impl PageInitializer for ChartPageSetup {
    fn initialize<'a>(
        &'a self,
        page: &'a Page,
    ) -> Pin<Box<dyn Future<Output = ExportResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let bundle = self.cache.get().ok_or_else(|| {
                ExportError::PoolInitFailed("charting bundle is not initialized".to_owned())
            })?;
            page.set_content(template::page_shell(&bundle))
                .await
                .map_err(|err| {
                    ExportError::BrowserUnavailable(format!("worker page setup failed: {err}"))
                })?;
            debug!("worker page warmed with bundle {}", bundle.version);
            Ok(())
        })
    }
}
