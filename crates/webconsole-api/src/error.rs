//! Error types for the terminal broker

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable identity on the request
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Identity is known but may not open a shell there
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Pod does not exist in the requested namespace
    #[error("pod {namespace}/{pod} not found")]
    PodNotFound {
        /// Namespace that was searched
        namespace: String,
        /// Pod that was requested
        pod: String,
    },

    /// Cluster is not registered or its metadata could not be read
    #[error("cluster not found: {0}")]
    ClusterInfoNotFound(String),

    /// No registered cluster hosts the cloud-shell backend
    #[error("control cluster not found: {0}")]
    ControlClusterNotFound(String),

    /// The cloud-shell backend has no running pod
    #[error("no running pod: {0}")]
    NoRunningPod(String),

    /// Kubeconfig material exists but cannot be turned into a client config
    #[error("failed to construct config for cluster {cluster}: {message}")]
    ConfigConstructionFailed {
        /// Cluster whose material is malformed
        cluster: String,
        /// Underlying failure
        message: String,
    },

    /// Session id is unknown to every store
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Browser sent something the terminal protocol does not allow
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Browser-facing connection is gone
    #[error("terminal connection closed")]
    ConnectionClosed,

    /// Exec stream could not be started or broke
    #[error("remote exec failed: {0}")]
    RemoteExecFailed(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code reported to callers
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidToken(_) => "InvalidToken",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::PodNotFound { .. } => "PodNotFound",
            Error::ClusterInfoNotFound(_) | Error::ConfigConstructionFailed { .. } => {
                "ClusterInfoNotFound"
            }
            Error::ControlClusterNotFound(_) => "ControlClusterNotFound",
            Error::NoRunningPod(_) => "NoRunningPod",
            Error::SessionNotFound(_) => "SessionNotFound",
            Error::ProtocolViolation(_) => "ProtocolViolation",
            Error::ConnectionClosed => "ConnectionClosed",
            Error::RemoteExecFailed(_) => "RemoteExecFailed",
            Error::Internal(_) => "InternalServerError",
        }
    }

    /// HTTP status the error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidToken(_) | Error::PermissionDenied(_) => StatusCode::UNAUTHORIZED,
            Error::PodNotFound { .. } | Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Error::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            Error::RemoteExecFailed(_) => StatusCode::BAD_GATEWAY,
            Error::ClusterInfoNotFound(_)
            | Error::ConfigConstructionFailed { .. }
            | Error::ControlClusterNotFound(_)
            | Error::NoRunningPod(_)
            | Error::ConnectionClosed
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body returned by the session-creation endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// HTTP status code
    #[serde(rename = "Code")]
    pub code: u16,
    /// Stable error code
    #[serde(rename = "ErrorCode")]
    pub error_code: String,
    /// Human-readable message
    #[serde(rename = "Message")]
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorInfo {
            code: status.as_u16(),
            error_code: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<webconsole_common::Error> for Error {
    fn from(e: webconsole_common::Error) -> Self {
        match e {
            webconsole_common::Error::Kubeconfig { cluster, message } => {
                Error::ConfigConstructionFailed { cluster, message }
            }
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
