//! Error taxonomy and JSON error bodies for the control API

use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the deployment and health components
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("no target servers resolved for deployment")]
    NoTargets,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl FleetError {
    pub fn server_not_found(id: impl Into<String>) -> Self {
        FleetError::NotFound {
            kind: "server",
            id: id.into(),
        }
    }

    pub fn configuration_not_found(id: impl Into<String>) -> Self {
        FleetError::NotFound {
            kind: "configuration",
            id: id.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FleetError::NotFound { .. } => ErrorCode::NotFound,
            FleetError::NoTargets => ErrorCode::NoTargets,
            FleetError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            FleetError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            FleetError::ApplyFailed(_) => ErrorCode::ApplyFailed,
            FleetError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            FleetError::Storage(_) => ErrorCode::StorageError,
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

/// Error codes carried in JSON error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    NoTargets,
    ValidationFailed,
    ConnectionFailed,
    ApplyFailed,
    InvalidRequest,
    Unauthorized,
    StorageError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::NoTargets => StatusCode::BAD_REQUEST,
            ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ApplyFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NoTargets => "NO_TARGETS",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ApplyFailed => "APPLY_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&FleetError> for ErrorResponse {
    fn from(err: &FleetError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::NoTargets.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorCode::StorageError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_fleet_error_messages() {
        let err = FleetError::configuration_not_found("cfg-1");
        assert_eq!(err.to_string(), "configuration not found: cfg-1");
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = FleetError::ConnectionFailed("refused".to_string());
        assert_eq!(err.to_string(), "connection failed: refused");

        let err: FleetError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_error_response_json() {
        let err = FleetError::server_not_found("srv-9");
        let json = ErrorResponse::from(&err).to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"server not found: srv-9\""));
        assert!(json.contains("\"status\":404"));
    }
}
