//! Output formats, chart constructors, and the response artifact.
//!
//! The extension and MIME mappings live here and nowhere else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExportError;

/// The artifact encodings the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Pdf,
    Svg,
}

impl OutputFormat {
    /// File extension for saved artifacts. JPEG deliberately maps to
    /// the short `jpg` form.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Pdf => "pdf",
            Self::Svg => "svg",
        }
    }

    /// MIME type for HTTP responses.
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Pdf => "application/pdf",
            Self::Svg => "image/svg+xml",
        }
    }

    /// Derive the format from an output file path, if its extension is
    /// one we know.
    #[must_use]
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::from_str(ext).ok()
    }
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "pdf" => Ok(Self::Pdf),
            "svg" => Ok(Self::Svg),
            other => Err(ExportError::ConfigInvalid(format!(
                "unknown output type '{other}', expected png, jpeg, jpg, pdf or svg"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Pdf => "pdf",
            Self::Svg => "svg",
        };
        formatter.write_str(name)
    }
}

/// Which charting-library entry point builds the chart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartConstructor {
    #[default]
    Chart,
    StockChart,
    MapChart,
    GanttChart,
}

impl ChartConstructor {
    /// The page-side function name on the library's global object.
    #[must_use]
    pub const fn entry_point(self) -> &'static str {
        match self {
            Self::Chart => "chart",
            Self::StockChart => "stockChart",
            Self::MapChart => "mapChart",
            Self::GanttChart => "ganttChart",
        }
    }
}

impl FromStr for ChartConstructor {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chart" | "Chart" => Ok(Self::Chart),
            "stockChart" | "StockChart" => Ok(Self::StockChart),
            "mapChart" | "MapChart" => Ok(Self::MapChart),
            "ganttChart" | "GanttChart" => Ok(Self::GanttChart),
            other => Err(ExportError::ConfigInvalid(format!(
                "unknown constructor '{other}'"
            ))),
        }
    }
}

/// The response payload: raw bytes plus the metadata a caller needs to
/// store or serve them.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Raw artifact bytes; SVG artifacts are UTF-8 text.
    pub bytes: Vec<u8>,
    /// MIME type derived from the output format.
    pub mime: &'static str,
    /// The server-assigned request identifier.
    pub request_id: String,
}

impl Artifact {
    #[must_use]
    pub fn new(bytes: Vec<u8>, format: OutputFormat, request_id: String) -> Self {
        Self {
            bytes,
            mime: format.mime(),
            request_id,
        }
    }
}
