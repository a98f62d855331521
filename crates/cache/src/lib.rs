//! One-time acquisition and memoization of the charting-library bundle.
//!
//! The bundle is assembled exactly once at startup and replaced only by
//! an explicit version change. Readers take an `Arc` snapshot and never
//! observe a half-written bundle; a failed update leaves the previous
//! bundle in force.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use reqwest::Client;
use sha2::{Digest as _, Sha256};

use export_core::config::HighchartsConfig;
use export_core::{ExportError, ExportResult};

pub mod fetch;
pub mod manifest;

use manifest::Manifest;

/// Where a bundle's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOrigin {
    /// Downloaded from the content-delivery origin.
    Cdn,
    /// Loaded from the on-disk cache without network I/O.
    Disk,
}

/// An immutable, fully assembled charting-library bundle.
#[derive(Debug, Clone)]
pub struct CachedBundle {
    /// `latest` or a dotted version tag.
    pub version: String,
    /// Concatenated JavaScript: core, then modules, then indicators,
    /// then custom scripts.
    pub source_text: String,
    /// When the bundle was assembled or loaded.
    pub fetched_at: DateTime<Utc>,
    /// Network or disk.
    pub origin: BundleOrigin,
    /// SHA-256 hex fingerprint of `source_text`.
    pub sha: String,
}

/// Process-wide bundle holder.
///
/// Publication is a pointer swap under a short write lock; `get`
/// clones the `Arc` and drops the lock immediately.
pub struct BundleCache {
    config: RwLock<HighchartsConfig>,
    current: RwLock<Option<Arc<CachedBundle>>>,
    client: Client,
}

impl BundleCache {
    /// Create an uninitialized cache for the given settings.
    #[must_use]
    pub fn new(config: HighchartsConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config: RwLock::new(config),
            current: RwLock::new(None),
            client,
        }
    }

    /// Assemble and publish the bundle. Idempotent: a second call with
    /// an already matching bundle is a no-op unless `forceFetch` is set.
    pub async fn init(&self) -> ExportResult<()> {
        let config = self.config_snapshot();
        if !config.force_fetch
            && let Some(bundle) = self.get()
            && bundle.version == config.version
        {
            return Ok(());
        }
        let bundle = self.assemble(&config, &config.version).await?;
        self.publish(bundle);
        Ok(())
    }

    /// Current bundle snapshot, if one has been published.
    #[must_use]
    pub fn get(&self) -> Option<Arc<CachedBundle>> {
        self.current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone))
    }

    /// Version tag of the published bundle.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.get().map(|bundle| bundle.version.clone())
    }

    /// Replace the bundle with a different library version.
    ///
    /// Validation failures and download failures both leave the active
    /// bundle untouched. Returns the now-active version tag.
    pub async fn update_version(&self, version: &str) -> ExportResult<String> {
        if !is_valid_version(version) {
            return Err(ExportError::CacheUpdateFailed(format!(
                "'{version}' is not a valid version tag"
            )));
        }

        let mut config = self.config_snapshot();
        // A version switch must not be satisfied by the old disk cache.
        config.force_fetch = true;
        let bundle = self.assemble(&config, version).await?;
        self.publish(bundle);

        if let Ok(mut guard) = self.config.write() {
            guard.version = version.to_owned();
        }
        info!("charting library switched to version {version}");
        Ok(version.to_owned())
    }

    /// Assemble a bundle for `version`: from disk when permitted and
    /// matching, from the network otherwise.
    async fn assemble(
        &self,
        config: &HighchartsConfig,
        version: &str,
    ) -> ExportResult<Arc<CachedBundle>> {
        let urls = fetch::script_urls(config, version);

        if !config.force_fetch
            && let Some(bundle) = Self::load_from_disk(config, version, &urls).await
        {
            info!(
                "using cached bundle {} (sha {})",
                bundle.version,
                &bundle.sha[..12.min(bundle.sha.len())]
            );
            return Ok(bundle);
        }

        let mut source_text = String::new();
        for url in &urls {
            let script = fetch::fetch_script(&self.client, url).await?;
            source_text.push_str(&script);
            source_text.push_str(";\n");
        }

        let sha = sha256_hex(&source_text);
        let fetched_at = Utc::now();
        let stored = Manifest {
            version: version.to_owned(),
            sha: sha.clone(),
            fetched_at,
            scripts: urls,
        };
        if let Err(err) = manifest::store(&config.cache_path, &stored, &source_text).await {
            // A read-only cache directory should not fail the export path.
            warn!("could not persist bundle to {}: {err}", config.cache_path.display());
        }

        info!(
            "assembled bundle {version} from {} ({} bytes)",
            config.cdn_url,
            source_text.len()
        );
        Ok(Arc::new(CachedBundle {
            version: version.to_owned(),
            source_text,
            fetched_at,
            origin: BundleOrigin::Cdn,
            sha,
        }))
    }

    /// Try the on-disk bundle; `None` on any mismatch or corruption.
    async fn load_from_disk(
        config: &HighchartsConfig,
        version: &str,
        urls: &[String],
    ) -> Option<Arc<CachedBundle>> {
        let stored = manifest::load(&config.cache_path).await.ok().flatten()?;
        if !stored.matches(version, urls) {
            return None;
        }
        let source_text = tokio::fs::read_to_string(manifest::bundle_path(&config.cache_path))
            .await
            .ok()?;
        if sha256_hex(&source_text) != stored.sha {
            warn!("cached bundle fingerprint mismatch, refetching");
            return None;
        }
        Some(Arc::new(CachedBundle {
            version: stored.version,
            source_text,
            fetched_at: stored.fetched_at,
            origin: BundleOrigin::Disk,
            sha: stored.sha,
        }))
    }

    fn publish(&self, bundle: Arc<CachedBundle>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(bundle);
        }
    }

    fn config_snapshot(&self) -> HighchartsConfig {
        self.config
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// Accept `latest` or one to three dotted groups of one or two digits.
#[must_use]
pub fn is_valid_version(version: &str) -> bool {
    if version == "latest" {
        return true;
    }
    let mut groups = 0usize;
    for part in version.split('.') {
        groups += 1;
        if groups > 3 || part.is_empty() || part.len() > 2 {
            return false;
        }
        if !part.bytes().all(|byte| byte.is_ascii_digit()) {
            return false;
        }
    }
    groups >= 1
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags() {
        assert!(is_valid_version("latest"));
        assert!(is_valid_version("11"));
        assert!(is_valid_version("11.0"));
        assert!(is_valid_version("11.0.0"));
        assert!(is_valid_version("9.29.99"));
        assert!(!is_valid_version(""));
        assert!(!is_valid_version("11.0.0.1"));
        assert!(!is_valid_version("111"));
        assert!(!is_valid_version("11.x"));
        assert!(!is_valid_version("v11"));
        assert!(!is_valid_version("11."));
    }

    #[test]
    fn sha_is_hex_of_content() {
        let sha = sha256_hex("abc");
        assert_eq!(sha.len(), 64);
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn invalid_version_leaves_bundle_untouched() {
        let cache = BundleCache::new(HighchartsConfig::default());
        cache.publish(Arc::new(CachedBundle {
            version: "10.3.3".to_owned(),
            source_text: "window.Highcharts = {};".to_owned(),
            fetched_at: Utc::now(),
            origin: BundleOrigin::Disk,
            sha: sha256_hex("window.Highcharts = {};"),
        }));

        let result = cache.update_version("not-a-version").await;
        assert!(matches!(result, Err(ExportError::CacheUpdateFailed(_))));
        assert_eq!(cache.version().as_deref(), Some("10.3.3"));
    }

    #[tokio::test]
    async fn failed_download_leaves_bundle_untouched() {
        let config = HighchartsConfig {
            // Unroutable origin; every fetch attempt fails fast.
            cdn_url: "http://127.0.0.1:9".to_owned(),
            ..HighchartsConfig::default()
        };
        let cache = BundleCache::new(config);
        cache.publish(Arc::new(CachedBundle {
            version: "10.3.3".to_owned(),
            source_text: String::new(),
            fetched_at: Utc::now(),
            origin: BundleOrigin::Disk,
            sha: sha256_hex(""),
        }));

        let result = cache.update_version("11.0.0").await;
        assert!(result.is_err());
        assert_eq!(cache.version().as_deref(), Some("10.3.3"));
    }

    #[tokio::test]
    async fn init_is_idempotent_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = HighchartsConfig {
            cache_path: dir.path().to_path_buf(),
            version: "11.0.0".to_owned(),
            ..HighchartsConfig::default()
        };
        let urls = fetch::script_urls(&config, "11.0.0");
        let source = "window.Highcharts = { version: '11.0.0' };";
        manifest::store(
            dir.path(),
            &Manifest {
                version: "11.0.0".to_owned(),
                sha: sha256_hex(source),
                fetched_at: Utc::now(),
                scripts: urls,
            },
            source,
        )
        .await?;

        let cache = BundleCache::new(config);
        cache.init().await?;
        let first = cache.get().ok_or_else(|| anyhow::anyhow!("no bundle"))?;
        assert_eq!(first.origin, BundleOrigin::Disk);
        assert_eq!(first.version, "11.0.0");

        // Second init keeps the already published bundle.
        cache.init().await?;
        let second = cache.get().ok_or_else(|| anyhow::anyhow!("no bundle"))?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_disk_bundle_is_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = HighchartsConfig {
            cache_path: dir.path().to_path_buf(),
            version: "11.0.0".to_owned(),
            ..HighchartsConfig::default()
        };
        let urls = fetch::script_urls(&config, "11.0.0");
        manifest::store(
            dir.path(),
            &Manifest {
                version: "11.0.0".to_owned(),
                sha: "deadbeef".to_owned(),
                fetched_at: Utc::now(),
                scripts: urls.clone(),
            },
            "tampered",
        )
        .await?;

        let loaded = BundleCache::load_from_disk(&config, "11.0.0", &urls).await;
        assert!(loaded.is_none());
        Ok(())
    }
}
