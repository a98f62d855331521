//! Chart export server binary.
//!
//! One-shot mode (`--infile`, `--batch`) performs the exports and
//! exits; otherwise the HTTP server runs until interrupted. Exit code
//! is 0 on clean shutdown and 1 on unrecoverable failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::{Context as _, bail, ensure};
use clap::Parser as _;
use log::{error, info};

use export_core::config::LoggingConfig;
use export_core::{Config, OutputFormat, RenderRequest, logging};
use export_engine::Exporter;
use export_server::cli::Cli;
use export_server::{AppState, serve};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match assemble_config(&cli) {
        Ok(config) => {
            logging::init(&config.logging)?;
            config
        }
        Err(err) => {
            // Make the failure visible even though the real logging
            // settings never materialized.
            let _best_effort = logging::init(&LoggingConfig::default());
            return Err(err.into());
        }
    };

    let exporter = Exporter::init_export(config)
        .await
        .context("service initialization failed")?;

    if cli.is_one_shot() {
        let outcome = run_one_shot(&exporter, &cli).await;
        exporter.shutdown().await;
        return outcome;
    }

    let state = Arc::new(AppState::new(exporter));
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("shutdown signal listener failed: {err}");
        }
        info!("interrupt received, shutting down");
    };
    serve(Arc::clone(&state), shutdown).await?;
    state.exporter.shutdown().await;
    Ok(())
}

/// Defaults, then config file, then environment, then CLI flags.
fn assemble_config(cli: &Cli) -> export_core::ExportResult<Config> {
    let mut config = Config::default();
    if let Some(path) = &cli.load_config {
        config.apply_file(path)?;
    }
    config.apply_env()?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run_one_shot(exporter: &Exporter, cli: &Cli) -> anyhow::Result<()> {
    if let Some(batch) = &cli.batch {
        let outcomes = exporter.batch_export(batch).await?;
        let mut failed = 0usize;
        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => info!("wrote {}", outcome.pair.output.display()),
                Err(err) => {
                    failed += 1;
                    error!("{} failed: {err}", outcome.pair.input.display());
                }
            }
        }
        ensure!(failed == 0, "{failed} of {} batch entries failed", outcomes.len());
        return Ok(());
    }

    let Some(infile) = &cli.infile else {
        bail!("one-shot mode needs --infile or --batch");
    };
    let options_text = tokio::fs::read_to_string(infile)
        .await
        .with_context(|| format!("cannot read {}", infile.display()))?;
    let chart_options = serde_json::from_str(&options_text)
        .with_context(|| format!("{} is not valid chart options JSON", infile.display()))?;

    let format = resolve_format(exporter.config(), cli)?;
    let constructor = match &cli.constr {
        Some(name) => name.parse()?,
        None => exporter.config().export.default_constructor.parse()?,
    };
    let request = RenderRequest {
        chart_options: Some(chart_options),
        output_format: format,
        constructor,
        scale: cli.scale,
        width: cli.width,
        height: cli.height,
        ..RenderRequest::default()
    };

    // An explicit outfile wins; otherwise one is synthesized from the
    // format.
    let outfile = cli
        .outfile
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("chart.{}", format.extension())));

    let artifact = exporter.export(request).await?;
    tokio::fs::write(&outfile, &artifact.bytes)
        .await
        .with_context(|| format!("cannot write {}", outfile.display()))?;
    info!("wrote {}", outfile.display());
    Ok(())
}

/// `--type` wins, then the outfile extension, then the configured
/// default.
fn resolve_format(config: &Config, cli: &Cli) -> anyhow::Result<OutputFormat> {
    if let Some(name) = &cli.output_type {
        return Ok(OutputFormat::from_str(name)?);
    }
    if let Some(outfile) = &cli.outfile
        && let Some(format) = OutputFormat::from_path(outfile)
    {
        return Ok(format);
    }
    Ok(OutputFormat::from_str(&config.export.default_type)?)
}
