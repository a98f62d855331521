//! The export request body and its mapping onto the engine request.
//!
//! The same field set arrives either as a JSON document or as a
//! multipart form of stringly values; both funnel through [`ExportBody`].

use std::collections::HashMap;
use std::str::FromStr as _;

use serde::Deserialize;
use serde_json::Value;

use export_core::config::ExportConfig;
use export_core::request::Resources;
use export_core::{ExportError, ExportResult, RenderRequest};

/// Raw request fields as the wire carries them.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportBody {
    /// Chart options; `options` is canonical, the rest are aliases.
    pub options: Option<Value>,
    pub infile: Option<Value>,
    pub data: Option<Value>,
    /// Stringified chart options.
    pub instr: Option<String>,
    /// Inline SVG document.
    pub svg: Option<String>,
    /// Output format name (`png`, `jpeg`, `jpg`, `pdf`, `svg`).
    #[serde(rename = "type")]
    pub output_type: Option<String>,
    /// Constructor name (`chart`, `stockChart`, `mapChart`, `ganttChart`).
    pub constr: Option<String>,
    pub scale: Option<f64>,
    pub global_options: Option<Value>,
    pub theme_options: Option<Value>,
    pub callback: Option<String>,
    pub custom_code: Option<String>,
    /// Resource bundle, either an object or a JSON string.
    pub resources: Option<Value>,
    /// Return the artifact base64-encoded in the body.
    pub b64: Option<bool>,
    /// Suppress the attachment content disposition.
    pub no_download: Option<bool>,
    /// Download file name without extension.
    pub filename: Option<String>,
}

impl ExportBody {
    /// Build the body from decoded multipart form fields.
    pub fn from_form(mut fields: HashMap<String, String>) -> ExportResult<Self> {
        let mut take = |name: &str| fields.remove(name).filter(|text| !text.is_empty());
        Ok(Self {
            options: take("options").map(parse_loose_json),
            infile: take("infile").map(parse_loose_json),
            data: take("data").map(parse_loose_json),
            instr: take("instr"),
            svg: take("svg"),
            output_type: take("type"),
            constr: take("constr"),
            scale: take("scale")
                .map(|text| {
                    f64::from_str(&text).map_err(|_parse| {
                        ExportError::ConfigInvalid(format!("scale is not a number: \"{text}\""))
                    })
                })
                .transpose()?,
            global_options: take("globalOptions").map(parse_loose_json),
            theme_options: take("themeOptions").map(parse_loose_json),
            callback: take("callback"),
            custom_code: take("customCode"),
            resources: take("resources").map(parse_loose_json),
            b64: take("b64").map(|text| text == "true" || text == "1"),
            no_download: take("noDownload").map(|text| text == "true" || text == "1"),
            filename: take("filename"),
        })
    }

    /// Whether the caller asked for a base64 body.
    #[must_use]
    pub fn wants_base64(&self) -> bool {
        self.b64.unwrap_or(false)
    }

    /// Whether the attachment disposition should be suppressed.
    #[must_use]
    pub fn suppress_download(&self) -> bool {
        self.no_download.unwrap_or(false)
    }

    /// Normalize into the engine's request, filling configured defaults.
    pub fn into_request(self, defaults: &ExportConfig) -> ExportResult<RenderRequest> {
        let mut chart_options = self
            .options
            .or(self.infile)
            .or(self.data)
            .map(coerce_options)
            .transpose()?;
        if chart_options.is_none()
            && let Some(text) = self.instr.as_deref()
        {
            chart_options = Some(serde_json::from_str(text).map_err(|err| {
                ExportError::ConfigInvalid(format!("instr is not valid JSON: {err}"))
            })?);
        }

        let output_format = self
            .output_type
            .as_deref()
            .unwrap_or(defaults.default_type.as_str())
            .parse()?;
        let constructor = self
            .constr
            .as_deref()
            .unwrap_or(defaults.default_constructor.as_str())
            .parse()?;

        let request = RenderRequest {
            chart_options,
            svg_document: self.svg,
            output_format,
            constructor,
            scale: self.scale,
            global_options: self.global_options,
            theme_options: self.theme_options,
            callback: self.callback,
            custom_code: self.custom_code,
            resources: parse_resources(self.resources)?,
            ..RenderRequest::default()
        };
        request.validate()?;
        Ok(request)
    }
}

/// Options fields may arrive as a JSON tree or as a stringified tree.
fn coerce_options(value: Value) -> ExportResult<Value> {
    match value {
        Value::String(text) => serde_json::from_str(&text).map_err(|err| {
            ExportError::ConfigInvalid(format!("chart options string is not valid JSON: {err}"))
        }),
        tree => Ok(tree),
    }
}

/// Form fields hold JSON trees as strings; JSON bodies hold them
/// directly. Non-JSON strings stay strings.
fn parse_loose_json(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn parse_resources(raw: Option<Value>) -> ExportResult<Resources> {
    let Some(raw) = raw else {
        return Ok(Resources::default());
    };
    let tree = coerce_options(raw)
        .map_err(|_err| ExportError::ConfigInvalid("resources is not valid JSON".to_owned()))?;
    serde_json::from_value(tree)
        .map_err(|err| ExportError::ConfigInvalid(format!("resources rejected: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use export_core::request::RequestKind;
    use export_core::{ExportResult, OutputFormat};
    use serde_json::json;

    fn defaults() -> ExportConfig {
        ExportConfig::default()
    }

    #[test]
    fn options_alias_precedence() -> ExportResult<()> {
        let body = ExportBody {
            options: Some(json!({"a": 1})),
            infile: Some(json!({"b": 2})),
            data: Some(json!({"c": 3})),
            ..ExportBody::default()
        };
        let request = body.into_request(&defaults())?;
        assert_eq!(request.chart_options, Some(json!({"a": 1})));
        Ok(())
    }

    #[test]
    fn infile_fills_in_for_missing_options() -> ExportResult<()> {
        let body = ExportBody {
            infile: Some(json!({"b": 2})),
            ..ExportBody::default()
        };
        let request = body.into_request(&defaults())?;
        assert_eq!(request.chart_options, Some(json!({"b": 2})));
        Ok(())
    }

    #[test]
    fn stringified_options_are_parsed() -> ExportResult<()> {
        let body = ExportBody {
            options: Some(Value::String(r#"{"chart":{"type":"column"}}"#.to_owned())),
            ..ExportBody::default()
        };
        let request = body.into_request(&defaults())?;
        assert_eq!(
            request.chart_options,
            Some(json!({"chart": {"type": "column"}}))
        );
        Ok(())
    }

    #[test]
    fn svg_only_body_classifies_as_inline_svg() -> ExportResult<()> {
        let body = ExportBody {
            svg: Some("<svg xmlns='http://www.w3.org/2000/svg'/>".to_owned()),
            output_type: Some("svg".to_owned()),
            ..ExportBody::default()
        };
        let request = body.into_request(&defaults())?;
        assert_eq!(request.kind()?, RequestKind::InlineSvg);
        assert_eq!(request.output_format, OutputFormat::Svg);
        Ok(())
    }

    #[test]
    fn defaults_apply_when_type_and_constr_are_absent() -> ExportResult<()> {
        let body = ExportBody {
            options: Some(json!({})),
            ..ExportBody::default()
        };
        let request = body.into_request(&defaults())?;
        assert_eq!(request.output_format, OutputFormat::Png);
        assert_eq!(request.constructor.entry_point(), "chart");
        Ok(())
    }

    #[test]
    fn unknown_type_is_rejected() {
        let body = ExportBody {
            options: Some(json!({})),
            output_type: Some("tiff".to_owned()),
            ..ExportBody::default()
        };
        assert!(body.into_request(&defaults()).is_err());
    }

    #[test]
    fn resources_accept_object_and_string_forms() -> ExportResult<()> {
        let object_form = ExportBody {
            options: Some(json!({})),
            resources: Some(json!({"js": "window.a = 1;", "files": ["x.css"]})),
            ..ExportBody::default()
        };
        let request = object_form.into_request(&defaults())?;
        assert_eq!(request.resources.js.as_deref(), Some("window.a = 1;"));
        assert_eq!(request.resources.files, vec!["x.css"]);

        let string_form = ExportBody {
            options: Some(json!({})),
            resources: Some(Value::String(r##"{"css": "#x {}"}"##.to_owned())),
            ..ExportBody::default()
        };
        let request = string_form.into_request(&defaults())?;
        assert_eq!(request.resources.css.as_deref(), Some("#x {}"));
        Ok(())
    }

    #[test]
    fn form_fields_coerce_scalars() -> ExportResult<()> {
        let mut fields = HashMap::new();
        fields.insert("options".to_owned(), r#"{"series":[]}"#.to_owned());
        fields.insert("type".to_owned(), "jpeg".to_owned());
        fields.insert("scale".to_owned(), "2".to_owned());
        fields.insert("b64".to_owned(), "true".to_owned());
        let body = ExportBody::from_form(fields)?;
        assert!(body.wants_base64());
        let request = body.into_request(&defaults())?;
        assert_eq!(request.output_format, OutputFormat::Jpeg);
        assert_eq!(request.scale, Some(2.0));
        Ok(())
    }

    #[test]
    fn bad_scale_in_form_is_rejected() {
        let mut fields = HashMap::new();
        fields.insert("scale".to_owned(), "big".to_owned());
        assert!(ExportBody::from_form(fields).is_err());
    }
}
