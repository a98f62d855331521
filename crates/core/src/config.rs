//! Layered runtime configuration.
//!
//! Values are resolved lowest-priority first: built-in defaults, then an
//! optional JSON config file, then `HIGHCHARTS_*` environment variables,
//! then explicit caller overrides, and finally CLI arguments (applied by
//! the binary). Each layer only touches the keys it actually provides.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExportError, ExportResult};
use crate::logging::LogLevel;

/// Environment variable prefix for every recognized key.
pub const ENV_PREFIX: &str = "HIGHCHARTS_";

/// Top-level configuration tree, nested layout.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub highcharts: HighchartsConfig,
    pub export: ExportConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Charting-library acquisition settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HighchartsConfig {
    /// `latest` or a dotted version like `11.0.0`.
    pub version: String,
    /// Content-delivery origin the scripts are fetched from.
    pub cdn_url: String,
    /// Core scripts, fetched and concatenated first.
    pub core_scripts: Vec<String>,
    /// Module scripts, concatenated after the core.
    pub module_scripts: Vec<String>,
    /// Indicator scripts, concatenated after the modules.
    pub indicator_scripts: Vec<String>,
    /// Fully qualified URLs appended last.
    pub custom_scripts: Vec<String>,
    /// Skip the on-disk bundle even when it matches.
    pub force_fetch: bool,
    /// Directory holding `highcharts.js` and `manifest.json`.
    pub cache_path: PathBuf,
}

impl Default for HighchartsConfig {
    fn default() -> Self {
        Self {
            version: "latest".to_owned(),
            cdn_url: "https://code.highcharts.com".to_owned(),
            core_scripts: vec!["highcharts".to_owned(), "highcharts-more".to_owned(), "highcharts-3d".to_owned()],
            module_scripts: vec![
                "stock".to_owned(),
                "map".to_owned(),
                "gantt".to_owned(),
                "exporting".to_owned(),
                "export-data".to_owned(),
                "accessibility".to_owned(),
                "annotations".to_owned(),
            ],
            indicator_scripts: vec!["indicators-all".to_owned()],
            custom_scripts: Vec::new(),
            force_fetch: false,
            cache_path: PathBuf::from(".cache"),
        }
    }
}

/// Per-export behavior and policy gates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportConfig {
    /// Output format used when a request does not name one.
    pub default_type: String,
    /// Constructor used when a request does not name one.
    pub default_constructor: String,
    /// Hard ceiling on the in-page render phase, in milliseconds.
    pub rasterization_timeout_ms: u64,
    /// Admit `callback`, `customCode` and `resources.js`.
    pub allow_code_execution: bool,
    /// Admit fields naming local files.
    pub allow_file_resources: bool,
    /// `development` includes failure detail in surfaced errors.
    pub run_mode: RunMode,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_type: "png".to_owned(),
            default_constructor: "chart".to_owned(),
            rasterization_timeout_ms: 1500,
            allow_code_execution: false,
            allow_file_resources: false,
            run_mode: RunMode::Production,
        }
    }
}

impl ExportConfig {
    #[must_use]
    pub const fn rasterization_timeout(&self) -> Duration {
        Duration::from_millis(self.rasterization_timeout_ms)
    }
}

/// Run mode; controls error verbosity at the public surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    #[default]
    Production,
}

/// Worker pool sizing and timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Workers created at startup and kept alive as a floor.
    pub min: usize,
    /// Hard ceiling on concurrent workers.
    pub max: usize,
    /// Exports served by one worker before mandatory recycling.
    pub work_limit: u32,
    /// Pending acquisitions admitted before fail-fast rejection.
    pub queue_size: usize,
    /// How long a caller waits for a worker, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Ceiling on a single worker creation attempt.
    pub create_timeout_ms: u64,
    /// Ceiling on worker destruction and shutdown draining.
    pub destroy_timeout_ms: u64,
    /// Idle workers above `min` are evicted after this long.
    pub idle_timeout_ms: u64,
    /// Delay between worker creation retries.
    pub create_retry_interval_ms: u64,
    /// Reaper scan period.
    pub reaper_interval_ms: u64,
    /// Whether the reaper runs at all.
    pub reaper_enabled: bool,
    /// Log per-export timings at verbose level.
    pub benchmarking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 4,
            max: 8,
            work_limit: 40,
            queue_size: 10,
            acquire_timeout_ms: 5000,
            create_timeout_ms: 5000,
            destroy_timeout_ms: 5000,
            idle_timeout_ms: 30_000,
            create_retry_interval_ms: 200,
            reaper_interval_ms: 1000,
            reaper_enabled: true,
            benchmarking: false,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub const fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    #[must_use]
    pub const fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub const fn create_retry_interval(&self) -> Duration {
        Duration::from_millis(self.create_retry_interval_ms)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Token expected in the `hc-auth` header of admin requests.
    /// Empty disables the version-change endpoint.
    pub admin_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 7801,
            admin_token: String::new(),
        }
    }
}

/// Log sink settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// 0 = silent .. 4 = verbose.
    pub level: u8,
    /// Directory log files are written to.
    pub dest: PathBuf,
    /// File name inside `dest`; appended to when file logging is on.
    pub file: String,
    /// Mirror log output to a file as well as the console.
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Notice as u8,
            dest: PathBuf::from("log"),
            file: "export-server.log".to_owned(),
            to_file: false,
        }
    }
}

impl Config {
    /// Load a JSON config file and merge it over `self`.
    ///
    /// Legacy flat layouts are migrated to the nested layout first, so
    /// old config files keep working without round-trip preservation.
    pub fn apply_file(&mut self, path: &Path) -> ExportResult<()> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ExportError::ConfigInvalid(format!("cannot read config file {}: {err}", path.display()))
        })?;
        let raw: Value = serde_json::from_str(&text).map_err(|err| {
            ExportError::ConfigInvalid(format!("config file {} is not valid JSON: {err}", path.display()))
        })?;
        let nested = migrate_legacy(raw);
        let parsed: Self = serde_json::from_value(merge_over(self.as_value(), nested))
            .map_err(|err| ExportError::ConfigInvalid(format!("config file rejected: {err}")))?;
        *self = parsed;
        Ok(())
    }

    /// Apply `HIGHCHARTS_*` environment variables.
    ///
    /// Unset and empty variables leave the current value alone; boolean
    /// variables accept `true`/`false`.
    pub fn apply_env(&mut self) -> ExportResult<()> {
        let lookup = |key: &str| -> Option<String> {
            env::var(format!("{ENV_PREFIX}{key}"))
                .ok()
                .filter(|value| !value.is_empty())
        };

        if let Some(version) = lookup("VERSION") {
            self.highcharts.version = version;
        }
        if let Some(cdn) = lookup("CDN_URL") {
            self.highcharts.cdn_url = cdn;
        }
        if let Some(scripts) = lookup("CORE_SCRIPTS") {
            self.highcharts.core_scripts = split_list(&scripts);
        }
        if let Some(scripts) = lookup("MODULE_SCRIPTS") {
            self.highcharts.module_scripts = split_list(&scripts);
        }
        if let Some(scripts) = lookup("INDICATOR_SCRIPTS") {
            self.highcharts.indicator_scripts = split_list(&scripts);
        }
        if let Some(scripts) = lookup("CUSTOM_SCRIPTS") {
            self.highcharts.custom_scripts = split_list(&scripts);
        }
        if let Some(flag) = lookup("FORCE_FETCH") {
            self.highcharts.force_fetch = parse_bool("FORCE_FETCH", &flag)?;
        }
        if let Some(path) = lookup("CACHE_PATH") {
            self.highcharts.cache_path = PathBuf::from(path);
        }

        if let Some(value) = lookup("POOL_MIN_WORKERS") {
            self.pool.min = parse_number("POOL_MIN_WORKERS", &value)?;
        }
        if let Some(value) = lookup("POOL_MAX_WORKERS") {
            self.pool.max = parse_number("POOL_MAX_WORKERS", &value)?;
        }
        if let Some(value) = lookup("POOL_WORK_LIMIT") {
            self.pool.work_limit = parse_number("POOL_WORK_LIMIT", &value)?;
        }
        if let Some(value) = lookup("POOL_QUEUE_SIZE") {
            self.pool.queue_size = parse_number("POOL_QUEUE_SIZE", &value)?;
        }
        if let Some(value) = lookup("POOL_ACQUIRE_TIMEOUT") {
            self.pool.acquire_timeout_ms = parse_number("POOL_ACQUIRE_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("POOL_CREATE_TIMEOUT") {
            self.pool.create_timeout_ms = parse_number("POOL_CREATE_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("POOL_DESTROY_TIMEOUT") {
            self.pool.destroy_timeout_ms = parse_number("POOL_DESTROY_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("POOL_IDLE_TIMEOUT") {
            self.pool.idle_timeout_ms = parse_number("POOL_IDLE_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("POOL_REAPER_INTERVAL") {
            self.pool.reaper_interval_ms = parse_number("POOL_REAPER_INTERVAL", &value)?;
        }
        if let Some(flag) = lookup("POOL_ENABLE_REAPER") {
            self.pool.reaper_enabled = parse_bool("POOL_ENABLE_REAPER", &flag)?;
        }
        if let Some(flag) = lookup("POOL_BENCHMARKING") {
            self.pool.benchmarking = parse_bool("POOL_BENCHMARKING", &flag)?;
        }

        if let Some(value) = lookup("RASTERIZATION_TIMEOUT") {
            self.export.rasterization_timeout_ms = parse_number("RASTERIZATION_TIMEOUT", &value)?;
        }
        if let Some(flag) = lookup("ALLOW_CODE_EXECUTION") {
            self.export.allow_code_execution = parse_bool("ALLOW_CODE_EXECUTION", &flag)?;
        }
        if let Some(flag) = lookup("ALLOW_FILE_RESOURCES") {
            self.export.allow_file_resources = parse_bool("ALLOW_FILE_RESOURCES", &flag)?;
        }
        if let Some(mode) = lookup("RUN_MODE") {
            self.export.run_mode = match mode.as_str() {
                "development" => RunMode::Development,
                "production" => RunMode::Production,
                other => {
                    return Err(ExportError::ConfigInvalid(format!(
                        "unknown run mode '{other}'"
                    )));
                }
            };
        }

        if let Some(host) = lookup("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = parse_number("SERVER_PORT", &port)?;
        }
        if let Some(token) = lookup("ADMIN_TOKEN") {
            self.server.admin_token = token;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = parse_number("LOG_LEVEL", &level)?;
        }
        if let Some(dest) = lookup("LOG_DEST") {
            self.logging.dest = PathBuf::from(dest);
        }
        if let Some(file) = lookup("LOG_FILE") {
            self.logging.file = file;
        }
        if let Some(flag) = lookup("LOG_TO_FILE") {
            self.logging.to_file = parse_bool("LOG_TO_FILE", &flag)?;
        }

        Ok(())
    }

    /// Reject impossible combinations before anything is started.
    pub fn validate(&self) -> ExportResult<()> {
        if self.pool.max == 0 {
            return Err(ExportError::ConfigInvalid(
                "pool.max must be at least 1".to_owned(),
            ));
        }
        if self.pool.min > self.pool.max {
            return Err(ExportError::ConfigInvalid(format!(
                "pool.min ({}) must not exceed pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.pool.work_limit == 0 {
            return Err(ExportError::ConfigInvalid(
                "pool.workLimit must be at least 1".to_owned(),
            ));
        }
        if self.export.rasterization_timeout_ms == 0 {
            return Err(ExportError::ConfigInvalid(
                "export.rasterizationTimeout must be positive".to_owned(),
            ));
        }
        if self.logging.level > LogLevel::Verbose as u8 {
            return Err(ExportError::ConfigInvalid(format!(
                "logging.level must lie within 0..=4, got {}",
                self.logging.level
            )));
        }
        self.export
            .default_type
            .parse::<crate::format::OutputFormat>()?;
        self.export
            .default_constructor
            .parse::<crate::format::ChartConstructor>()?;
        Ok(())
    }

    fn as_value(&self) -> Value {
        // Config is a plain data tree; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Map a legacy flat configuration object into the nested layout.
///
/// Keys already in nested sections pass through untouched and win over
/// their flat equivalents. Unknown keys are dropped.
#[must_use]
pub fn migrate_legacy(raw: Value) -> Value {
    let Value::Object(map) = raw else {
        return raw;
    };

    let flat_paths: HashMap<&str, (&str, &str)> = HashMap::from([
        ("version", ("highcharts", "version")),
        ("cdnURL", ("highcharts", "cdnUrl")),
        ("forceFetch", ("highcharts", "forceFetch")),
        ("cachePath", ("highcharts", "cachePath")),
        ("workers", ("pool", "max")),
        ("minWorkers", ("pool", "min")),
        ("maxWorkers", ("pool", "max")),
        ("workLimit", ("pool", "workLimit")),
        ("queueSize", ("pool", "queueSize")),
        ("timeoutThreshold", ("export", "rasterizationTimeoutMs")),
        ("allowCodeExecution", ("export", "allowCodeExecution")),
        ("allowFileResources", ("export", "allowFileResources")),
        ("host", ("server", "host")),
        ("port", ("server", "port")),
        ("logLevel", ("logging", "level")),
        ("logDest", ("logging", "dest")),
        ("logFile", ("logging", "file")),
    ]);

    let mut nested = serde_json::Map::new();
    for (key, value) in map {
        if let Some((section, field)) = flat_paths.get(key.as_str()) {
            let entry = nested
                .entry((*section).to_owned())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(section_map) = entry
                && !section_map.contains_key(*field)
            {
                section_map.insert((*field).to_owned(), value);
            }
        } else if matches!(
            key.as_str(),
            "highcharts" | "export" | "pool" | "server" | "logging"
        ) {
            // Already nested; nested sections win over flat keys.
            nested.insert(key, value);
        }
    }
    Value::Object(nested)
}

/// Overlay `patch` onto `base`, object keys merged recursively.
fn merge_over(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_over(base_value, patch_value),
                    None => patch_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, patch_value) => patch_value,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> ExportResult<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ExportError::ConfigInvalid(format!(
            "{ENV_PREFIX}{key} must be \"true\" or \"false\", got \"{other}\""
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> ExportResult<T> {
    raw.parse().map_err(|_err| {
        ExportError::ConfigInvalid(format!("{ENV_PREFIX}{key} is not a valid number: \"{raw}\""))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    #[test]
    fn defaults_validate() -> ExportResult<()> {
        Config::default().validate()
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut config = Config::default();
        config.pool.min = 9;
        config.pool.max = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_work_limit_is_rejected() {
        let mut config = Config::default();
        config.pool.work_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_file_overrides_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"pool": {{"min": 1, "max": 2}}, "highcharts": {{"version": "10.3.3"}}}}"#
        )?;
        let mut config = Config::default();
        config.apply_file(file.path())?;
        assert_eq!(config.pool.min, 1);
        assert_eq!(config.pool.max, 2);
        assert_eq!(config.highcharts.version, "10.3.3");
        // Untouched keys keep their defaults.
        assert_eq!(config.pool.work_limit, 40);
        Ok(())
    }

    #[test]
    fn legacy_flat_layout_migrates() {
        let nested = migrate_legacy(json!({
            "logLevel": 4,
            "maxWorkers": 16,
            "allowCodeExecution": true,
            "cdnURL": "https://cdn.example"
        }));
        assert_eq!(nested["logging"]["level"], json!(4));
        assert_eq!(nested["pool"]["max"], json!(16));
        assert_eq!(nested["export"]["allowCodeExecution"], json!(true));
        assert_eq!(nested["highcharts"]["cdnUrl"], json!("https://cdn.example"));
    }

    #[test]
    fn nested_sections_win_over_flat_keys() {
        let nested = migrate_legacy(json!({
            "maxWorkers": 16,
            "pool": {"max": 3}
        }));
        assert_eq!(nested["pool"]["max"], json!(3));
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list("highcharts, highcharts-more,,gantt"),
            vec!["highcharts", "highcharts-more", "gantt"]
        );
    }

    #[test]
    fn bool_parsing_is_strict() {
        assert!(parse_bool("X", "true").is_ok_and(|flag| flag));
        assert!(parse_bool("X", "1").is_err());
        assert!(parse_bool("X", "TRUE").is_err());
    }
}
