//! Sidecar manifest for the on-disk bundle.
//!
//! The manifest lets a restart skip the network when the cached bundle
//! was assembled from the same version and script set.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use export_core::{ExportError, ExportResult};

/// File name of the assembled bundle inside the cache directory.
pub const BUNDLE_FILE: &str = "highcharts.js";
/// File name of the manifest sidecar.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Metadata persisted next to the assembled bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub sha: String,
    pub fetched_at: DateTime<Utc>,
    /// The fetched script URLs, in concatenation order.
    pub scripts: Vec<String>,
}

impl Manifest {
    /// Whether this manifest covers the requested version and scripts.
    #[must_use]
    pub fn matches(&self, version: &str, scripts: &[String]) -> bool {
        self.version == version && self.scripts == scripts
    }
}

/// Path to the bundle file inside `cache_path`.
#[must_use]
pub fn bundle_path(cache_path: &Path) -> PathBuf {
    cache_path.join(BUNDLE_FILE)
}

/// Path to the manifest file inside `cache_path`.
#[must_use]
pub fn manifest_path(cache_path: &Path) -> PathBuf {
    cache_path.join(MANIFEST_FILE)
}

/// Read and parse the manifest, if one exists.
pub async fn load(cache_path: &Path) -> ExportResult<Option<Manifest>> {
    let path = manifest_path(cache_path);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ExportError::CacheUpdateFailed(format!(
                "cannot read {}: {err}",
                path.display()
            )));
        }
    };
    let manifest = serde_json::from_str(&text).map_err(|err| {
        ExportError::CacheUpdateFailed(format!("manifest {} is corrupt: {err}", path.display()))
    })?;
    Ok(Some(manifest))
}

/// Persist the bundle text and its manifest.
pub async fn store(cache_path: &Path, manifest: &Manifest, source_text: &str) -> ExportResult<()> {
    tokio::fs::create_dir_all(cache_path).await.map_err(|err| {
        ExportError::CacheUpdateFailed(format!(
            "cannot create cache directory {}: {err}",
            cache_path.display()
        ))
    })?;
    let bundle = bundle_path(cache_path);
    tokio::fs::write(&bundle, source_text)
        .await
        .map_err(|err| {
            ExportError::CacheUpdateFailed(format!("cannot write {}: {err}", bundle.display()))
        })?;
    let text = serde_json::to_string_pretty(manifest).map_err(|err| {
        ExportError::CacheUpdateFailed(format!("cannot serialize manifest: {err}"))
    })?;
    let sidecar = manifest_path(cache_path);
    tokio::fs::write(&sidecar, text).await.map_err(|err| {
        ExportError::CacheUpdateFailed(format!("cannot write {}: {err}", sidecar.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_manifest_is_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(load(dir.path()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn store_then_load_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = Manifest {
            version: "11.0.0".to_owned(),
            sha: "abc".to_owned(),
            fetched_at: Utc::now(),
            scripts: vec!["https://code.example/highcharts.js".to_owned()],
        };
        store(dir.path(), &manifest, "window.Highcharts = {};").await?;

        let loaded = load(dir.path()).await?.ok_or_else(|| anyhow::anyhow!("manifest missing"))?;
        assert!(loaded.matches("11.0.0", &manifest.scripts));
        assert!(!loaded.matches("11.0.1", &manifest.scripts));

        let stored = tokio::fs::read_to_string(bundle_path(dir.path())).await?;
        assert_eq!(stored, "window.Highcharts = {};");
        Ok(())
    }
}
