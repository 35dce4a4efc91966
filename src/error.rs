//! Error types for tollgate.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How an upstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// The per-request timeout elapsed.
    Timeout,
    /// Connection refused, reset, or dropped before a response arrived.
    Transport,
    /// The provider answered with a non-2xx status.
    Status(u16),
    /// The provider answered 2xx with a body we could not read.
    InvalidResponse,
}

impl UpstreamFailure {
    /// Map a reqwest error onto the failure taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() || err.is_body() {
            Self::InvalidResponse
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport
        }
    }

    /// Status code carried by the failure, if the provider sent one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Transport => write!(f, "connection error"),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::InvalidResponse => write!(f, "invalid response"),
        }
    }
}

/// Main error type for tollgate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Model '{model}' not found in configuration. Available models: {}", .available.join(", "))]
    UnknownModel {
        model: String,
        available: Vec<String>,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Provider '{provider}' failed ({failure}): {message}")]
    Upstream {
        provider: String,
        failure: UpstreamFailure,
        message: String,
    },

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status returned to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Upstream { failure, .. } => match failure {
                UpstreamFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
                UpstreamFailure::Status(code) if (400..500).contains(code) => {
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI error `type` and `code` strings.
    pub fn kind(&self) -> (&'static str, &'static str) {
        match self {
            Error::Config(_) => ("invalid_request_error", "invalid_config"),
            Error::UnknownModel { .. } => ("invalid_request_error", "model_not_found"),
            Error::Validation(_) => ("invalid_request_error", "invalid_request"),
            Error::Upstream { failure, .. } => match failure {
                UpstreamFailure::Timeout => ("timeout_error", "upstream_timeout"),
                UpstreamFailure::Status(429) => ("rate_limit_error", "rate_limit_exceeded"),
                UpstreamFailure::Status(401) | UpstreamFailure::Status(403) => {
                    ("authentication_error", "upstream_auth_failed")
                }
                _ => ("api_error", "upstream_error"),
            },
            Error::Storage(_) => ("api_error", "storage_error"),
            Error::NotFound(_) => ("invalid_request_error", "not_found"),
            Error::Unauthorized => ("authentication_error", "invalid_api_key"),
            Error::Internal(_) => ("api_error", "internal_error"),
        }
    }

    /// The OpenAI-compatible error body for this error.
    pub fn envelope(&self) -> serde_json::Value {
        let (error_type, code) = self.kind();
        error_envelope(&self.to_string(), error_type, code)
    }
}

/// Build an OpenAI-compatible error envelope.
pub fn error_envelope(message: &str, error_type: &str, code: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code
        }
    })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut response = (status, axum::Json(self.envelope())).into_response();
        if matches!(self, Error::Unauthorized) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
