//! Error taxonomy shared by every component.
//!
//! Each variant corresponds to one externally observable failure mode.
//! Components never invent ad-hoc error strings for callers; everything
//! that crosses a crate boundary is one of these kinds.

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type ExportResult<T> = Result<T, ExportError>;

/// Every failure a caller can observe, exhaustively.
#[derive(Debug, Error)]
pub enum ExportError {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The request carried executable text while code execution is off.
    #[error("the request carried executable code but code execution is not allowed")]
    CodeExecutionForbidden,

    /// The request named a local file while file resources are off.
    #[error("the request named a file resource but file resources are not allowed")]
    FileResourceForbidden,

    /// A version update could not be completed; the old bundle stays live.
    #[error("charting library update failed: {0}")]
    CacheUpdateFailed(String),

    /// The pool could not bring up its minimum worker count.
    #[error("worker pool initialization failed: {0}")]
    PoolInitFailed(String),

    /// The acquisition queue is at capacity.
    #[error("the request queue is full")]
    QueueOverflow,

    /// No worker became available within the acquire timeout.
    #[error("timed out after {0}ms waiting for a render worker")]
    AcquireTimeout(u64),

    /// Rendering did not complete within the rasterization timeout.
    #[error("rendering did not finish within {0}ms")]
    RenderTimeout(u64),

    /// The browser process is gone and could not be brought back.
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// The page rendered but the artifact could not be captured.
    #[error("rasterization failed: {0}")]
    RasterizeFailed(String),

    /// The captured artifact could not be encoded for the caller.
    #[error("output encoding failed: {0}")]
    OutputEncodeFailed(String),

    /// The server is shutting down and refuses new work.
    #[error("the server is shutting down")]
    Shutdown,
}

impl ExportError {
    /// Stable machine-readable code for logs and error payloads.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::CodeExecutionForbidden => "CodeExecutionForbidden",
            Self::FileResourceForbidden => "FileResourceForbidden",
            Self::CacheUpdateFailed(_) => "CacheUpdateFailed",
            Self::PoolInitFailed(_) => "PoolInitFailed",
            Self::QueueOverflow => "QueueOverflow",
            Self::AcquireTimeout(_) => "AcquireTimeout",
            Self::RenderTimeout(_) => "RenderTimeout",
            Self::BrowserUnavailable(_) => "BrowserUnavailable",
            Self::RasterizeFailed(_) => "RasterizeFailed",
            Self::OutputEncodeFailed(_) => "OutputEncodeFailed",
            Self::Shutdown => "Shutdown",
        }
    }

    /// HTTP status the error maps to at the public surface.
    ///
    /// Policy and validation failures are the caller's fault (4xx);
    /// capture and browser failures are ours (5xx). Queue pressure maps
    /// to 429 so clients can back off and retry.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::ConfigInvalid(_) => 400,
            Self::CodeExecutionForbidden | Self::FileResourceForbidden => 403,
            Self::QueueOverflow => 429,
            Self::AcquireTimeout(_) | Self::Shutdown => 503,
            Self::RenderTimeout(_) => 504,
            Self::CacheUpdateFailed(_)
            | Self::PoolInitFailed(_)
            | Self::BrowserUnavailable(_)
            | Self::RasterizeFailed(_)
            | Self::OutputEncodeFailed(_) => 500,
        }
    }

    /// Whether the failure indicates a page-level fault that should
    /// recycle the worker that served the job.
    #[must_use]
    pub const fn recycles_worker(&self) -> bool {
        matches!(
            self,
            Self::RenderTimeout(_) | Self::BrowserUnavailable(_) | Self::RasterizeFailed(_)
        )
    }

    /// Serializable payload surfaced to callers.
    #[must_use]
    pub fn to_payload(&self, request_id: &str) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            request_id: request_id.to_owned(),
        }
    }
}

/// The `{code, message, requestId}` body every surfaced error carries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ExportError::QueueOverflow.http_status(), 429);
        assert_eq!(ExportError::AcquireTimeout(5000).http_status(), 503);
        assert_eq!(ExportError::RenderTimeout(1000).http_status(), 504);
        assert_eq!(ExportError::CodeExecutionForbidden.http_status(), 403);
        assert_eq!(
            ExportError::RasterizeFailed("screenshot".to_owned()).http_status(),
            500
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ExportError::QueueOverflow.code(), "QueueOverflow");
        assert_eq!(
            ExportError::CacheUpdateFailed(String::new()).code(),
            "CacheUpdateFailed"
        );
    }

    #[test]
    fn payload_carries_request_id() {
        let payload = ExportError::Shutdown.to_payload("req-7");
        assert_eq!(payload.code, "Shutdown");
        assert_eq!(payload.request_id, "req-7");
    }
}
