//! Admission policy for untrusted request content.
//!
//! Two independent gates: executable text (callback, custom code,
//! attached JS) and local file references. Both default to closed and
//! are opened only by explicit configuration.

use export_core::config::ExportConfig;
use export_core::{ExportError, ExportResult, RenderRequest};

/// Reject requests whose content the configuration does not admit.
pub fn enforce(config: &ExportConfig, request: &RenderRequest) -> ExportResult<()> {
    if !config.allow_code_execution && request.carries_code() {
        return Err(ExportError::CodeExecutionForbidden);
    }
    if !config.allow_file_resources && request.names_files() {
        return Err(ExportError::FileResourceForbidden);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use export_core::request::Resources;

    fn closed_config() -> ExportConfig {
        ExportConfig {
            allow_code_execution: false,
            allow_file_resources: false,
            ..ExportConfig::default()
        }
    }

    #[test]
    fn callback_is_rejected_when_code_is_off() {
        let request = RenderRequest {
            callback: Some("function (chart) {}".to_owned()),
            ..RenderRequest::default()
        };
        assert!(matches!(
            enforce(&closed_config(), &request),
            Err(ExportError::CodeExecutionForbidden)
        ));
    }

    #[test]
    fn custom_code_is_rejected_when_code_is_off() {
        let request = RenderRequest {
            custom_code: Some("while (true) {}".to_owned()),
            ..RenderRequest::default()
        };
        assert!(enforce(&closed_config(), &request).is_err());
    }

    #[test]
    fn resource_js_is_rejected_when_code_is_off() {
        let request = RenderRequest {
            resources: Resources {
                js: Some("window.leak = 1;".to_owned()),
                ..Resources::default()
            },
            ..RenderRequest::default()
        };
        assert!(enforce(&closed_config(), &request).is_err());
    }

    #[test]
    fn files_are_rejected_when_file_resources_are_off() {
        let request = RenderRequest {
            resources: Resources {
                files: vec!["./theme.css".to_owned()],
                ..Resources::default()
            },
            ..RenderRequest::default()
        };
        assert!(matches!(
            enforce(&closed_config(), &request),
            Err(ExportError::FileResourceForbidden)
        ));
    }

    #[test]
    fn open_gates_admit_everything() {
        let config = ExportConfig {
            allow_code_execution: true,
            allow_file_resources: true,
            ..ExportConfig::default()
        };
        let request = RenderRequest {
            callback: Some("function (chart) {}".to_owned()),
            resources: Resources {
                js: Some("1;".to_owned()),
                files: vec!["data.json".to_owned()],
                ..Resources::default()
            },
            ..RenderRequest::default()
        };
        assert!(enforce(&config, &request).is_ok());
    }

    #[test]
    fn plain_requests_pass_closed_gates() {
        let request = RenderRequest::default();
        assert!(enforce(&closed_config(), &request).is_ok());
    }
}
