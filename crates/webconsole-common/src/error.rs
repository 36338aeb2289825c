//! Error types shared by the web console crates
//!
//! Errors carry the context they were raised in (cluster name, operation) so
//! that log lines are useful without a backtrace.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared Kubernetes helpers
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Kubeconfig material could not be turned into a client config
    #[error("invalid kubeconfig for {cluster}: {message}")]
    Kubeconfig {
        /// Cluster the kubeconfig belongs to
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a kubeconfig error for a cluster
    pub fn kubeconfig(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubeconfig_error_display() {
        let err = Error::kubeconfig("member-1", "missing current-context");
        assert_eq!(
            err.to_string(),
            "invalid kubeconfig for member-1: missing current-context"
        );
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("boom");
        assert_eq!(err.to_string(), "internal error [unknown]: boom");
    }

    #[test]
    fn test_internal_error_with_context() {
        let err = Error::internal_with_context("create_client", "no config");
        assert_eq!(err.to_string(), "internal error [create_client]: no config");
    }
}
