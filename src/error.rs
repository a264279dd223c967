use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the egress dispatcher
#[derive(Error, Debug)]
pub enum EgressError {
    // Forwarding errors
    #[error("Transport error via {exit}: {message}")]
    Transport { exit: String, message: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Blocked by destination via {exit}")]
    Blocked { exit: String },

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Catalog errors
    #[error("Invalid node {key}: {reason}")]
    NodeConfig { key: String, reason: String },

    // Tunnel process errors
    #[error("Tunnel process error: {0}")]
    Process(String),

    #[error("Local port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Local port {port} was not released in time")]
    PortNotReleased { port: u16 },

    #[error("Exit not found: {index}")]
    ExitNotFound { index: usize },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for egress operations
pub type Result<T> = std::result::Result<T, EgressError>;

impl EgressError {
    pub fn transport(exit: impl Into<String>, message: impl ToString) -> Self {
        EgressError::Transport {
            exit: exit.into(),
            message: message.to_string(),
        }
    }

    /// Whether this failure happened before a response was received
    /// (connect/handshake/timeout), i.e. whether a retry on another path makes sense.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EgressError::Transport { .. } | EgressError::Timeout | EgressError::Http(_)
        )
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            EgressError::InvalidRequest(_)
            | EgressError::UnsupportedScheme(_)
            | EgressError::NodeConfig { .. }
            | EgressError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            EgressError::Blocked { .. } => StatusCode::FORBIDDEN,

            // 404 Not Found
            EgressError::ExitNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            EgressError::PortInUse { .. } | EgressError::PortNotReleased { .. } => {
                StatusCode::CONFLICT
            }

            // 502 Bad Gateway
            EgressError::Transport { .. } | EgressError::Http(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            EgressError::Process(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            EgressError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            EgressError::Io(_) | EgressError::Json(_) | EgressError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for EgressError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for EgressError {
    fn from(err: hyper::Error) -> Self {
        EgressError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for EgressError {
    fn from(err: url::ParseError) -> Self {
        EgressError::InvalidRequest(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EgressError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EgressError::Timeout
    }
}
