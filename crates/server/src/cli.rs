//! Command-line interface and its overlay onto the configuration.
//!
//! With `--infile` or `--batch` the binary performs the exports and
//! exits; otherwise it starts the HTTP server. CLI values are the
//! highest-priority configuration layer.

use std::path::PathBuf;

use clap::Parser;

use export_core::Config;

/// Chart export server: renders chart configurations and SVG documents
/// to PNG, JPEG, PDF or SVG through a pooled headless browser.
#[derive(Debug, Parser)]
#[command(name = "export-server", version, about)]
pub struct Cli {
    /// JSON configuration file applied below env vars and CLI flags.
    #[arg(long = "load-config", value_name = "FILE")]
    pub load_config: Option<PathBuf>,

    /// Chart options JSON file for a one-shot export.
    #[arg(long, value_name = "FILE")]
    pub infile: Option<PathBuf>,

    /// Artifact path for a one-shot export; extension picks the format
    /// unless --type is given.
    #[arg(long, value_name = "FILE")]
    pub outfile: Option<PathBuf>,

    /// Output format: png, jpeg, jpg, pdf or svg.
    #[arg(long = "type", value_name = "FORMAT")]
    pub output_type: Option<String>,

    /// Chart constructor: chart, stockChart, mapChart or ganttChart.
    #[arg(long, value_name = "CONSTRUCTOR")]
    pub constr: Option<String>,

    /// Device pixel ratio within [0.1, 5.0].
    #[arg(long)]
    pub scale: Option<f64>,

    /// Explicit chart width in pixels.
    #[arg(long)]
    pub width: Option<f64>,

    /// Explicit chart height in pixels.
    #[arg(long)]
    pub height: Option<f64>,

    /// Semicolon-separated `input=output` pairs exported concurrently.
    #[arg(long, value_name = "PAIRS")]
    pub batch: Option<String>,

    /// Charting library version tag (`latest` or `N[.N[.N]]`).
    #[arg(long = "hc-version", value_name = "VERSION")]
    pub hc_version: Option<String>,

    /// Listener host for server mode.
    #[arg(long)]
    pub host: Option<String>,

    /// Listener port for server mode.
    #[arg(long)]
    pub port: Option<u16>,

    /// Initial worker count.
    #[arg(long = "min-workers")]
    pub min_workers: Option<usize>,

    /// Worker ceiling.
    #[arg(long = "max-workers")]
    pub max_workers: Option<usize>,

    /// Admit callback/customCode/resource JS in requests.
    #[arg(long = "allow-code-execution")]
    pub allow_code_execution: bool,

    /// Admit request fields naming local files.
    #[arg(long = "allow-file-resources")]
    pub allow_file_resources: bool,

    /// Log level: 0 silent, 1 error, 2 warning, 3 notice, 4 verbose.
    #[arg(long = "log-level")]
    pub log_level: Option<u8>,

    /// Mirror logs to the configured log file.
    #[arg(long = "log-to-file")]
    pub log_to_file: bool,
}

impl Cli {
    /// Whether this invocation is a one-shot export instead of a server.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.infile.is_some() || self.batch.is_some()
    }

    /// Overlay CLI flags onto an already layered configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(version) = &self.hc_version {
            config.highcharts.version.clone_from(version);
        }
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(min) = self.min_workers {
            config.pool.min = min;
        }
        if let Some(max) = self.max_workers {
            config.pool.max = max;
        }
        if let Some(output_type) = &self.output_type {
            config.export.default_type.clone_from(output_type);
        }
        if let Some(constr) = &self.constr {
            config.export.default_constructor.clone_from(constr);
        }
        if self.allow_code_execution {
            config.export.allow_code_execution = true;
        }
        if self.allow_file_resources {
            config.export.allow_file_resources = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_to_file {
            config.logging.to_file = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_overlay_config() {
        let cli = Cli::parse_from([
            "export-server",
            "--port",
            "9005",
            "--max-workers",
            "16",
            "--allow-code-execution",
            "--log-level",
            "4",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.port, 9005);
        assert_eq!(config.pool.max, 16);
        assert!(config.export.allow_code_execution);
        assert_eq!(config.logging.level, 4);
        // Untouched values keep their defaults.
        assert_eq!(config.pool.min, 4);
    }

    #[test]
    fn one_shot_detection() {
        let serve = Cli::parse_from(["export-server"]);
        assert!(!serve.is_one_shot());

        let single = Cli::parse_from(["export-server", "--infile", "chart.json"]);
        assert!(single.is_one_shot());

        let batch = Cli::parse_from(["export-server", "--batch", "a.json=a.png"]);
        assert!(batch.is_one_shot());
    }

    #[test]
    fn absent_flags_do_not_disturb_config() {
        let cli = Cli::parse_from(["export-server"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(!config.export.allow_code_execution);
        assert_eq!(config.server.port, 7801);
    }
}
