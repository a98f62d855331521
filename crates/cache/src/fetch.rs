//! Script URL construction and retried downloads.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;

use export_core::config::HighchartsConfig;
use export_core::{ExportError, ExportResult};

/// Download attempts per script.
const FETCH_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const BACKOFF_START: Duration = Duration::from_millis(250);
/// Retry delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Build the ordered list of script URLs for a configuration.
///
/// Order is load-bearing: later scripts depend on symbols the earlier
/// ones define. Core scripts come first, then modules, then indicators,
/// then custom URLs verbatim.
#[must_use]
pub fn script_urls(config: &HighchartsConfig, version: &str) -> Vec<String> {
    let origin = config.cdn_url.trim_end_matches('/');
    let version_path = if version == "latest" {
        String::new()
    } else {
        format!("{version}/")
    };

    let mut urls = Vec::new();
    for script in &config.core_scripts {
        urls.push(format!("{origin}/{version_path}{script}.js"));
    }
    for script in &config.module_scripts {
        urls.push(format!("{origin}/{version_path}modules/{script}.js"));
    }
    for script in &config.indicator_scripts {
        urls.push(format!("{origin}/{version_path}indicators/{script}.js"));
    }
    for url in &config.custom_scripts {
        urls.push(url.clone());
    }
    urls
}

/// Download one script with bounded retry and exponential backoff.
pub async fn fetch_script(client: &Client, url: &str) -> ExportResult<String> {
    let mut delay = BACKOFF_START;
    let mut last_error = String::new();

    for attempt in 1..=FETCH_ATTEMPTS {
        match try_fetch(client, url).await {
            Ok(text) => {
                debug!("fetched {url} ({} bytes, attempt {attempt})", text.len());
                return Ok(text);
            }
            Err(message) => {
                warn!("fetch of {url} failed (attempt {attempt}/{FETCH_ATTEMPTS}): {message}");
                last_error = message;
                if attempt < FETCH_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    Err(ExportError::CacheUpdateFailed(format!(
        "giving up on {url} after {FETCH_ATTEMPTS} attempts: {last_error}"
    )))
}

async fn try_fetch(client: &Client, url: &str) -> Result<String, String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("server answered {status}"));
    }
    response.text().await.map_err(|err| err.to_string())
}
