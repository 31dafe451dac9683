//! JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::provider::ProviderError;
use crate::sandbox::SandboxError;
use crate::transcode::TranscodeError;

/// Body of every failed API call: `{ "error": "...", "code": "..." }`.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let code = match &err {
            ProviderError::NoStreamModule(_) | ProviderError::NoModule { .. } => "NO_MODULE",
            ProviderError::NoStreamFunction(_) | ProviderError::NoExport { .. } => "NO_EXPORT",
            ProviderError::InvalidResult { .. } => "INVALID_RESULT",
            ProviderError::Sandbox(SandboxError::Timeout(_)) => {
                return Self::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string());
            }
            ProviderError::Sandbox(SandboxError::Cancelled) => "CANCELLED",
            ProviderError::Sandbox(SandboxError::Script(_) | SandboxError::NotAFunction(_)) => {
                "PROVIDER_ERROR"
            }
            ProviderError::Sandbox(_) => "SANDBOX_ERROR",
        };
        tracing::warn!(code, error = %err, "Provider call failed");
        Self::internal(code, err.to_string())
    }
}

impl From<TranscodeError> for ApiError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::InvalidInput(msg) => Self::bad_request(msg),
            TranscodeError::TranscoderUnavailable => {
                Self::internal("TRANSCODER_UNAVAILABLE", err.to_string())
            }
            TranscodeError::TranscoderSpawn { .. } => {
                tracing::error!(error = %err, "Transcoder failed to start");
                Self::internal("TRANSCODER_SPAWN", err.to_string())
            }
            TranscodeError::Probe(_) => Self::internal("TRANSCODER_PROBE", err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;
    use std::time::Duration;

    #[test]
    fn provider_errors_are_server_errors() {
        let err: ApiError = ProviderError::NoStreamModule("vega".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "NO_MODULE");

        let err: ApiError = ProviderError::Sandbox(SandboxError::Script("link expired".into())).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "link expired");

        let err: ApiError = ProviderError::InvalidResult {
            role: Role::Stream,
            message: "not an array".into(),
        }
        .into();
        assert_eq!(err.code, "INVALID_RESULT");
    }

    #[test]
    fn timeouts_are_gateway_timeouts() {
        let err: ApiError = ProviderError::Sandbox(SandboxError::Timeout(Duration::from_secs(10))).into();
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn transcode_input_errors_are_client_errors() {
        let err: ApiError = TranscodeError::InvalidInput("bad url".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = TranscodeError::TranscoderUnavailable.into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "TRANSCODER_UNAVAILABLE");
    }
}
