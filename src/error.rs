//! Error handling for the sensor host

use crate::notify::Severity;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No network address known; connecting is a no-op
    #[error("No network address known for device {0}")]
    AddressUnresolved(String),

    /// Socket fault on connect, read or write
    #[error("Connection to {address} failed: {reason}")]
    ConnectFailure { address: String, reason: String },

    /// Nothing received within the idle window
    #[error("No data from {address} within {timeout:?}")]
    IdleTimeout { address: String, timeout: Duration },

    /// Malformed inbound payload
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Explicit stop
    #[error("Cancelled")]
    Cancelled,

    /// Interval change requested with no streaming session
    #[error("Device {0} is not streaming; interval unchanged")]
    IntervalChangeRejected(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ProtocolDecode(e.to_string())
    }
}

impl Error {
    /// Severity used when the failure is shown to operators
    pub fn severity(&self) -> Severity {
        match self {
            Error::IntervalChangeRejected(_) | Error::AddressUnresolved(_) => Severity::Warning,
            Error::Cancelled => Severity::Info,
            _ => Severity::Error,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::AddressUnresolved(_) => (StatusCode::NOT_FOUND, "ADDRESS_UNRESOLVED"),
            Error::ConnectFailure { .. } => (StatusCode::BAD_GATEWAY, "CONNECT_FAILURE"),
            Error::IdleTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "IDLE_TIMEOUT"),
            Error::ProtocolDecode(_) => (StatusCode::BAD_GATEWAY, "PROTOCOL_DECODE_ERROR"),
            Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
            Error::IntervalChangeRejected(_) => (StatusCode::CONFLICT, "INTERVAL_CHANGE_REJECTED"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Sqlx(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, error_code, message = %message, "Request error");
        } else {
            tracing::debug!(status = %status, error_code, message = %message, "Request rejected");
        }

        let body = Json(json!({
            "error_code": error_code,
            "severity": self.severity(),
            "message": message
        }));

        (status, body).into_response()
    }
}
