//! The normalized render request.
//!
//! Chart options are deliberately opaque: they travel through the engine
//! as a `serde_json::Value` tree and are serialized only at the page
//! boundary. No schema is imposed on them here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExportError, ExportResult};
use crate::format::{ChartConstructor, OutputFormat};

/// Scale bounds accepted for device-pixel-ratio rendering.
pub const MIN_SCALE: f64 = 0.1;
/// Upper scale bound.
pub const MAX_SCALE: f64 = 5.0;

/// How the request drives rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A structured chart configuration built by the charting library.
    ChartConfig,
    /// A standalone SVG document rendered as-is.
    InlineSvg,
}

/// Optional CSS/JS/file bundle attached to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// JavaScript fragment, gated by the code-execution policy.
    pub js: Option<String>,
    /// CSS fragment injected into the page shell.
    pub css: Option<String>,
    /// Local file names, gated by the file-resource policy.
    pub files: Vec<String>,
}

impl Resources {
    /// Whether any field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.js.is_none() && self.css.is_none() && self.files.is_empty()
    }
}

/// A fully normalized export request.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Opaque chart options; `None` for inline-SVG requests.
    pub chart_options: Option<Value>,
    /// Inline SVG document text.
    pub svg_document: Option<String>,
    /// Requested artifact encoding.
    pub output_format: OutputFormat,
    /// Library entry point that builds the chart.
    pub constructor: ChartConstructor,
    /// Explicit output width in CSS pixels.
    pub width: Option<f64>,
    /// Explicit output height in CSS pixels.
    pub height: Option<f64>,
    /// Device pixel ratio, clamped to [`MIN_SCALE`]..=[`MAX_SCALE`].
    pub scale: Option<f64>,
    /// Options applied through the library's global-options entry point.
    pub global_options: Option<Value>,
    /// Theme applied before `global_options` (user options win last).
    pub theme_options: Option<Value>,
    /// Post-render hook source, gated by the code-execution policy.
    pub callback: Option<String>,
    /// Source executed before chart construction, same gate.
    pub custom_code: Option<String>,
    /// Attached resource bundle.
    pub resources: Resources,
    /// Server-assigned identifier used in logs and filenames.
    pub request_id: String,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            chart_options: None,
            svg_document: None,
            output_format: OutputFormat::Png,
            constructor: ChartConstructor::Chart,
            width: None,
            height: None,
            scale: None,
            global_options: None,
            theme_options: None,
            callback: None,
            custom_code: None,
            resources: Resources::default(),
            request_id: new_request_id(),
        }
    }
}

impl RenderRequest {
    /// Classify the request. Chart options win when both inputs are set.
    pub fn kind(&self) -> ExportResult<RequestKind> {
        if self.chart_options.is_some() {
            return Ok(RequestKind::ChartConfig);
        }
        if self.svg_document.is_some() {
            return Ok(RequestKind::InlineSvg);
        }
        Err(ExportError::ConfigInvalid(
            "request carries neither chart options nor an svg document".to_owned(),
        ))
    }

    /// The effective device pixel ratio after clamping.
    #[must_use]
    pub fn effective_scale(&self) -> f64 {
        self.scale.unwrap_or(1.0).clamp(MIN_SCALE, MAX_SCALE)
    }

    /// Whether the request carries any executable text.
    #[must_use]
    pub fn carries_code(&self) -> bool {
        non_empty(self.callback.as_deref())
            || non_empty(self.custom_code.as_deref())
            || non_empty(self.resources.js.as_deref())
    }

    /// Whether the request names local file resources.
    #[must_use]
    pub fn names_files(&self) -> bool {
        !self.resources.files.is_empty()
    }

    /// Validate sizing fields. Dimensions must be positive; the scale
    /// must already sit inside the accepted bounds when given.
    pub fn validate(&self) -> ExportResult<()> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(dim) = value
                && (!dim.is_finite() || dim <= 0.0)
            {
                return Err(ExportError::ConfigInvalid(format!(
                    "{name} must be a positive number, got {dim}"
                )));
            }
        }
        if let Some(scale) = self.scale
            && (!scale.is_finite() || !(MIN_SCALE..=MAX_SCALE).contains(&scale))
        {
            return Err(ExportError::ConfigInvalid(format!(
                "scale must lie within [{MIN_SCALE}, {MAX_SCALE}], got {scale}"
            )));
        }
        Ok(())
    }
}

/// Mint a fresh request identifier.
#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_empty(text: Option<&str>) -> bool {
    text.is_some_and(|value| !value.trim().is_empty())
}
