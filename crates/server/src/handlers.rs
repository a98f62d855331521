//! HTTP handlers: export, health, and the version-change admin call.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest as _, Multipart, Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use export_core::config::RunMode;
use export_core::{Artifact, ExportError, OutputFormat};

use crate::AppState;
use crate::body::ExportBody;

/// Upper bound on accepted request bodies.
const BODY_LIMIT: usize = 16 * 1024 * 1024;
/// Admin token header for the version-change endpoint.
const AUTH_HEADER: &str = "hc-auth";

/// `POST /` — run one export and answer with the artifact bytes.
pub async fn export(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let body = match read_body(request).await {
        Ok(body) => body,
        Err(err) => return error_response(&err, "-", state.run_mode()),
    };

    let wants_base64 = body.wants_base64();
    let suppress_download = body.suppress_download();
    let filename = body.filename.clone().unwrap_or_else(|| "chart".to_owned());

    let render_request = match body.into_request(&state.exporter.config().export) {
        Ok(render_request) => render_request,
        Err(err) => return error_response(&err, "-", state.run_mode()),
    };
    let request_id = render_request.request_id.clone();
    let format = render_request.output_format;

    match state.exporter.export(render_request).await {
        Ok(artifact) => {
            artifact_response(&artifact, format, &filename, wants_base64, suppress_download)
        }
        Err(err) => {
            warn!("export {request_id} failed: {err}");
            error_response(&err, &request_id, state.run_mode())
        }
    }
}

/// `GET /health` — service status and pool statistics.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthPayload> {
    let stats = state.exporter.stats_snapshot();
    Json(HealthPayload {
        status: "OK",
        uptime: state.exporter.uptime().as_secs(),
        server_version: state.server_version,
        highcharts_version: state
            .exporter
            .library_version()
            .unwrap_or_else(|| "unknown".to_owned()),
        pool: state.exporter.pool_snapshot(),
        attempted_exports: stats.attempted_exports,
        performed_exports: stats.performed_exports,
        failed_exports: stats.failed_exports,
        average_export_time: stats.average_export_time,
        moving_average: stats.moving_average,
    })
}

/// `POST /change_hc_version/{version}` — swap the charting library.
pub async fn change_version(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
    headers: HeaderMap,
) -> Response {
    let configured = &state.exporter.config().server.admin_token;
    if configured.is_empty() {
        return admin_error(
            StatusCode::UNAUTHORIZED,
            "version changes are disabled; no admin token is configured",
        );
    }
    let presented = headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != configured {
        return admin_error(StatusCode::UNAUTHORIZED, "invalid admin token");
    }

    if !bundle_cache::is_valid_version(&version) {
        return admin_error(
            StatusCode::BAD_REQUEST,
            &format!("'{version}' is not a valid version tag"),
        );
    }

    match state.exporter.update_version(&version).await {
        Ok(active) => {
            info!("library version changed to {active}");
            Json(json!({ "version": active })).into_response()
        }
        Err(err) => admin_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// Health endpoint payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPayload {
    pub status: &'static str,
    pub uptime: u64,
    pub server_version: &'static str,
    pub highcharts_version: String,
    pub pool: browser_pool::PoolSnapshot,
    pub attempted_exports: u64,
    pub performed_exports: u64,
    pub failed_exports: u64,
    pub average_export_time: f64,
    pub moving_average: f64,
}

/// Decode the body as JSON or as a multipart form by content type.
async fn read_body(request: Request) -> Result<ExportBody, ExportError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &()).await.map_err(|err| {
            ExportError::ConfigInvalid(format!("multipart body rejected: {err}"))
        })?;
        return read_form(multipart).await;
    }

    let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|err| ExportError::ConfigInvalid(format!("cannot read request body: {err}")))?;
    if bytes.is_empty() {
        return Err(ExportError::ConfigInvalid("request body is empty".to_owned()));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| ExportError::ConfigInvalid(format!("request body is not valid JSON: {err}")))
}

async fn read_form(mut multipart: Multipart) -> Result<ExportBody, ExportError> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ExportError::ConfigInvalid(format!("multipart field rejected: {err}"))
    })? {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };
        let text = field.text().await.map_err(|err| {
            ExportError::ConfigInvalid(format!("multipart field '{name}' rejected: {err}"))
        })?;
        fields.insert(name, text);
    }
    ExportBody::from_form(fields)
}

/// Build the artifact response with content type and disposition.
fn artifact_response(
    artifact: &Artifact,
    format: OutputFormat,
    filename: &str,
    wants_base64: bool,
    suppress_download: bool,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, artifact.mime);
    if !suppress_download {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{filename}.{}\"",
                format.extension()
            ),
        );
    }
    let payload = if wants_base64 {
        BASE64_STANDARD.encode(&artifact.bytes).into_bytes()
    } else {
        artifact.bytes.clone()
    };
    builder
        .body(Body::from(payload))
        .unwrap_or_else(|_err| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Map an engine error onto its HTTP status and payload.
fn error_response(err: &ExportError, request_id: &str, run_mode: RunMode) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = err.to_payload(request_id);
    let mut body = serde_json::to_value(&payload).unwrap_or_else(|_err| json!({}));
    if run_mode == RunMode::Development
        && let Some(map) = body.as_object_mut()
    {
        map.insert("detail".to_owned(), json!(format!("{err:?}")));
    }
    (status, Json(body)).into_response()
}

fn admin_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": status.canonical_reason().unwrap_or("error"), "message": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_maps_status() {
        let response = error_response(&ExportError::QueueOverflow, "req-1", RunMode::Production);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = error_response(
            &ExportError::AcquireTimeout(5000),
            "req-2",
            RunMode::Production,
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = error_response(
            &ExportError::RenderTimeout(1000),
            "req-3",
            RunMode::Production,
        );
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn artifact_response_sets_disposition() {
        let artifact = Artifact::new(vec![1, 2, 3], OutputFormat::Png, "req".to_owned());
        let response = artifact_response(&artifact, OutputFormat::Png, "chart", false, false);
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(disposition, "attachment; filename=\"chart.png\"");
    }

    #[test]
    fn no_download_drops_disposition() {
        let artifact = Artifact::new(vec![1], OutputFormat::Svg, "req".to_owned());
        let response = artifact_response(&artifact, OutputFormat::Svg, "chart", false, true);
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("image/svg+xml")
        );
    }
}
