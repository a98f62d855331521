//! Batch export parsing and fan-out.
//!
//! A batch is a semicolon-separated list of `input=output` pairs. Each
//! pair becomes one concurrent export; concurrency is bounded by the
//! worker pool itself. Partial failures are reported per pair.

use std::path::PathBuf;
use std::str::FromStr as _;

use serde_json::Value;

use export_core::{ExportError, ExportResult, OutputFormat, RenderRequest};

/// One `input=output` entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPair {
    /// Chart options JSON file to read.
    pub input: PathBuf,
    /// Artifact file to write; its extension picks the format.
    pub output: PathBuf,
}

impl BatchPair {
    /// Output format derived from the output extension, PNG otherwise.
    #[must_use]
    pub fn output_format(&self) -> OutputFormat {
        OutputFormat::from_path(&self.output).unwrap_or(OutputFormat::Png)
    }
}

/// Result of one batch entry.
#[derive(Debug)]
pub struct BatchOutcome {
    pub pair: BatchPair,
    pub result: ExportResult<()>,
}

/// Parse a `a.json=a.png;b.json=b.jpeg` batch description.
pub fn parse_batch(spec: &str) -> ExportResult<Vec<BatchPair>> {
    let mut pairs = Vec::new();
    for entry in spec.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((input, output)) = entry.split_once('=') else {
            return Err(ExportError::ConfigInvalid(format!(
                "batch entry '{entry}' is not of the form input=output"
            )));
        };
        let input = input.trim();
        let output = output.trim();
        if input.is_empty() || output.is_empty() {
            return Err(ExportError::ConfigInvalid(format!(
                "batch entry '{entry}' has an empty side"
            )));
        }
        pairs.push(BatchPair {
            input: PathBuf::from(input),
            output: PathBuf::from(output),
        });
    }
    if pairs.is_empty() {
        return Err(ExportError::ConfigInvalid(
            "batch description contains no pairs".to_owned(),
        ));
    }
    Ok(pairs)
}

/// Build the render request for one pair from its input file contents.
pub fn pair_request(pair: &BatchPair, options_text: &str) -> ExportResult<RenderRequest> {
    let options = Value::from_str(options_text).map_err(|err| {
        ExportError::ConfigInvalid(format!(
            "{} is not valid chart options JSON: {err}",
            pair.input.display()
        ))
    })?;
    Ok(RenderRequest {
        chart_options: Some(options),
        output_format: pair.output_format(),
        ..RenderRequest::default()
    })
}
