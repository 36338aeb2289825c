//! Common types for the web console: cluster CRD, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the web console HTTP server
pub const DEFAULT_SERVER_PORT: u16 = 9081;

/// Namespace the web console and the cloud-shell backend run in
pub const WEBCONSOLE_SYSTEM_NAMESPACE: &str = "kubecube-system";

/// Label key identifying the cloud-shell backend deployment's pods
pub const CLOUD_SHELL_LABEL_KEY: &str = "kubecube.io/app";
