//! HTML page shells that host a chart inside the worker page.
//!
//! Every produced page pins the chart to `<div id="container">` wrapped
//! in `<div id="chart-container">`, and raises the page-side
//! `isRenderComplete` flag once the chart callback fires. The output is
//! a deterministic function of the bundle fingerprint and the request.

use serde_json::Value;

use bundle_cache::CachedBundle;
use export_core::RenderRequest;

/// Static shell a fresh worker page is warmed with: the library bundle
/// plus the container markup, no chart yet.
#[must_use]
pub fn page_shell(bundle: &CachedBundle) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<!-- bundle {sha} -->
<style>
html, body {{ margin: 0; padding: 0; }}
#chart-container {{ display: inline-block; }}
</style>
<script>{bundle}</script>
</head>
<body>
<div id="chart-container"><div id="container"></div></div>
<script>
window.isRenderComplete = false;
if (window.Highcharts) {{
  window.Highcharts.setOptions({{ plotOptions: {{ series: {{ animation: false }} }} }});
}}
</script>
</body>
</html>"#,
        sha = &bundle.sha[..12.min(bundle.sha.len())],
        bundle = bundle.source_text,
    )
}

/// Full page for one chart-config export.
#[must_use]
pub fn render_page(bundle: &CachedBundle, request: &RenderRequest) -> String {
    let css = request
        .resources
        .css
        .as_deref()
        .map(|fragment| format!("<style>{fragment}</style>"))
        .unwrap_or_default();
    let extra_js = request
        .resources
        .js
        .as_deref()
        .map(|fragment| format!("<script>{fragment}</script>"))
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<!-- bundle {sha} -->
<style>
html, body {{ margin: 0; padding: 0; }}
#chart-container {{ display: inline-block; }}
</style>
{css}
<script>{bundle}</script>
</head>
<body>
<div id="chart-container"><div id="container"></div></div>
{extra_js}
<script>{script}</script>
</body>
</html>"#,
        sha = &bundle.sha[..12.min(bundle.sha.len())],
        css = css,
        bundle = bundle.source_text,
        extra_js = extra_js,
        script = render_script(request),
    )
}

/// Page for an inline SVG document rasterization. The document renders
/// as-is, so the completion flag is raised immediately.
#[must_use]
pub fn svg_page(svg_document: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<style>
html, body {{ margin: 0; padding: 0; }}
#chart-container {{ display: inline-block; }}
</style>
</head>
<body>
<div id="chart-container">{svg_document}</div>
<script>window.isRenderComplete = true;</script>
</body>
</html>"#
    )
}

/// The in-page script that applies options, runs gated code, builds the
/// chart and raises the completion flag.
fn render_script(request: &RenderRequest) -> String {
    let options = embed_json(request.chart_options.as_ref());
    let theme = embed_json(request.theme_options.as_ref());
    let globals = embed_json(request.global_options.as_ref());
    let constructor = request.constructor.entry_point();

    let custom_code = request
        .custom_code
        .as_deref()
        .map(|source| format!("(function (options) {{\n{source}\n}})(options);"))
        .unwrap_or_default();
    let callback = request.callback.as_deref().unwrap_or("null");

    let mut sizing = String::new();
    if let Some(width) = request.width {
        sizing.push_str(&format!("options.chart.width = {width};\n"));
    }
    if let Some(height) = request.height {
        sizing.push_str(&format!("options.chart.height = {height};\n"));
    }

    format!(
        r#"window.isRenderComplete = false;
(function () {{
  'use strict';
  var H = window.Highcharts;
  if (!H) {{ return; }}
  // Snapshot the global option state so one job cannot bleed theme or
  // locale settings into the worker's next job.
  window.__priorOptions = H.merge(true, {{}}, H.getOptions());
  H.setOptions({{ plotOptions: {{ series: {{ animation: false }} }} }});
  var themeOptions = {theme};
  if (themeOptions) {{ H.setOptions(themeOptions); }}
  var globalOptions = {globals};
  if (globalOptions) {{ H.setOptions(globalOptions); }}
  var options = {options};
  {custom_code}
  var chartCallback = {callback};
  options.chart = options.chart || {{}};
  options.chart.animation = false;
  {sizing}window.__chart = H.{constructor}('container', options, function (chart) {{
    if (chartCallback) {{ chartCallback(chart); }}
    window.isRenderComplete = true;
  }});
}}());"#
    )
}

/// Script run after rasterization: destroy the chart and restore the
/// captured global options.
#[must_use]
pub fn reset_script() -> &'static str {
    r#"(function () {
  var H = window.Highcharts;
  if (window.__chart && typeof window.__chart.destroy === 'function') {
    window.__chart.destroy();
    window.__chart = null;
  }
  if (H && window.__priorOptions) {
    H.setOptions(window.__priorOptions);
    window.__priorOptions = null;
  }
  window.isRenderComplete = false;
}());"#
}

/// Serialize a JSON tree for embedding inside a `<script>` element.
///
/// `</script` must not appear verbatim in the payload or the browser
/// terminates the element early.
fn embed_json(value: Option<&Value>) -> String {
    match value {
        Some(tree) => serde_json::to_string(tree)
            .unwrap_or_else(|_err| "null".to_owned())
            .replace("</", "<\\/"),
        None => "null".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundle_cache::BundleOrigin;
    use export_core::request::Resources;
    use serde_json::json;

    fn sample_bundle() -> CachedBundle {
        CachedBundle {
            version: "11.0.0".to_owned(),
            source_text: "window.Highcharts = { chart: function () {} };".to_owned(),
            fetched_at: chrono::Utc::now(),
            origin: BundleOrigin::Disk,
            sha: "0123456789abcdef".to_owned(),
        }
    }

    #[test]
    fn shell_contains_bundle_and_containers() {
        let shell = page_shell(&sample_bundle());
        assert!(shell.contains(r#"<div id="chart-container"><div id="container"></div></div>"#));
        assert!(shell.contains("window.Highcharts"));
        assert!(shell.contains("0123456789ab"));
    }

    #[test]
    fn render_page_is_deterministic() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({"series": [{"data": [1, 2, 3]}]})),
            ..RenderRequest::default()
        };
        assert_eq!(
            render_page(&bundle, &request),
            render_page(&bundle, &request)
        );
    }

    #[test]
    fn options_and_constructor_are_embedded() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({"chart": {"type": "column"}})),
            constructor: "stockChart".parse().unwrap_or_default(),
            width: Some(600.0),
            ..RenderRequest::default()
        };
        let page = render_page(&bundle, &request);
        assert!(page.contains(r#"{"chart":{"type":"column"}}"#));
        assert!(page.contains("H.stockChart('container'"));
        assert!(page.contains("options.chart.width = 600;"));
    }

    #[test]
    fn theme_applies_before_globals() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({})),
            theme_options: Some(json!({"colors": ["#111111"]})),
            global_options: Some(json!({"lang": {"decimalPoint": ","}})),
            ..RenderRequest::default()
        };
        let page = render_page(&bundle, &request);
        let theme_at = page.find("#111111").unwrap_or(usize::MAX);
        let globals_at = page.find("decimalPoint").unwrap_or(0);
        assert!(theme_at < globals_at);
    }

    #[test]
    fn script_closing_tags_are_escaped() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({"title": {"text": "</script><b>x</b>"}})),
            ..RenderRequest::default()
        };
        let page = render_page(&bundle, &request);
        assert!(!page.contains(r#""text":"</script>"#));
        assert!(page.contains(r"<\/script>"));
    }

    #[test]
    fn custom_code_receives_options() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({})),
            custom_code: Some("options.title = { text: 'patched' };".to_owned()),
            ..RenderRequest::default()
        };
        let page = render_page(&bundle, &request);
        assert!(page.contains("(function (options) {"));
        assert!(page.contains("options.title = { text: 'patched' };"));
    }

    #[test]
    fn css_resource_is_injected() {
        let bundle = sample_bundle();
        let request = RenderRequest {
            chart_options: Some(json!({})),
            resources: Resources {
                css: Some("#container { width: 640px; }".to_owned()),
                ..Resources::default()
            },
            ..RenderRequest::default()
        };
        let page = render_page(&bundle, &request);
        assert!(page.contains("<style>#container { width: 640px; }</style>"));
    }

    #[test]
    fn svg_page_raises_completion_immediately() {
        let page = svg_page("<svg xmlns='http://www.w3.org/2000/svg'/>");
        assert!(page.contains("window.isRenderComplete = true;"));
        assert!(page.contains("<svg xmlns='http://www.w3.org/2000/svg'/>"));
    }
}
