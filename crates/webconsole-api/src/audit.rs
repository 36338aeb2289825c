//! Terminal audit events
//!
//! Keystroke lines (and optionally process output) are published to an HTTP
//! audit service. Delivery runs on its own task with a bounded retry loop so
//! the terminal data path never waits on the audit service. Events that still
//! fail after the last attempt are logged and dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use webconsole_common::retry::{retry_with_backoff, RetryConfig};

use crate::session::ConnectionInfo;

/// Attempts per event, including the first
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
/// Wait before the first retry
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(80);
/// Growth factor between retries
pub const RETRY_MULTIPLIER: f64 = 2.5;
/// Timeout for a single delivery request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Idle connections kept per audit host
pub const MAX_IDLE_PER_HOST: usize = 100;

/// Audit delivery failures
///
/// Never surfaced to terminal users.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Audit configuration is unusable
    #[error("invalid audit configuration: {0}")]
    InvalidConfig(String),

    /// Request could not be sent or timed out
    #[error("audit request failed: {0}")]
    Transport(String),

    /// Audit service answered with a non-success status
    #[error("audit service returned status {0}")]
    Status(u16),

    /// Event could not be serialized
    #[error("failed to encode audit event: {0}")]
    Encode(String),
}

/// Which stream an event captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// A completed input line
    Stdin,
    /// A fragment of process output
    Stdout,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Stdin => f.write_str("stdin"),
            DataType::Stdout => f.write_str("stdout"),
        }
    }
}

/// Audit event as sent to the audit service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMsg {
    /// Session the data belongs to
    pub session_id: String,
    /// When the event was captured
    pub create_time: DateTime<Utc>,
    /// Pod name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    /// Pod namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Cluster name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    /// Captured text
    pub data: String,
    /// Captured stream
    pub data_type: DataType,
    /// Client address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    /// Client user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// User the shell runs as inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,
    /// Web user on the originating platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_user: Option<String>,
    /// Originating platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl AuditMsg {
    /// Build an event for a session, stamped with the current time
    pub fn from_connection(
        session_id: &str,
        info: &ConnectionInfo,
        data: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        let audit = info.audit.clone().unwrap_or_default();
        Self {
            session_id: session_id.to_string(),
            create_time: Utc::now(),
            pod_name: info.pod_name.clone(),
            namespace: info.namespace.clone(),
            cluster_name: info.cluster_name.clone(),
            data: data.into(),
            data_type,
            remote_ip: audit.remote_ip,
            user_agent: audit.user_agent,
            container_user: info.script_user.clone(),
            web_user: audit.web_user,
            platform: audit.platform,
        }
    }
}

/// One delivery attempt to the audit service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditTransport: Send + Sync {
    /// Send an encoded event; `Err` counts as a failed attempt
    async fn send(&self, payload: &str) -> Result<(), AuditError>;
}

/// HTTP delivery with a pooled client
pub struct HttpAuditTransport {
    client: reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
}

impl HttpAuditTransport {
    /// Create a transport
    ///
    /// `headers` are `(name, value)` pairs added to every request.
    pub fn new(url: &str, method: &str, headers: &[(String, String)]) -> Result<Self, AuditError> {
        let url = Url::parse(url)
            .map_err(|e| AuditError::InvalidConfig(format!("audit url {}: {}", url, e)))?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| AuditError::InvalidConfig(format!("audit method {}: {}", method, e)))?;

        let mut header_map = HeaderMap::new();
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| AuditError::InvalidConfig(format!("header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| AuditError::InvalidConfig(format!("header {}: {}", name, e)))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| AuditError::InvalidConfig(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            method,
            url,
            headers: header_map,
        })
    }
}

#[async_trait]
impl AuditTransport for HttpAuditTransport {
    async fn send(&self, payload: &str) -> Result<(), AuditError> {
        let response = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| AuditError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Status(status.as_u16()));
        }
        debug!(status = status.as_u16(), "Audit service accepted event");
        Ok(())
    }
}

/// Parse a `Name=Value` header flag
pub fn parse_header_pair(raw: &str) -> Result<(String, String), AuditError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(AuditError::InvalidConfig(format!(
            "header {:?} is not Name=Value",
            raw
        ))),
    }
}

/// Retry schedule for audit delivery
pub fn delivery_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: MAX_DELIVERY_ATTEMPTS,
        initial_delay: INITIAL_RETRY_DELAY,
        max_delay: Duration::from_secs(10),
        backoff_multiplier: RETRY_MULTIPLIER,
        jitter: false,
    }
}

/// Publishes audit events
///
/// Only constructed when auditing is enabled.
pub struct AuditPublisher {
    transport: Arc<dyn AuditTransport>,
    retry: RetryConfig,
    stdout_enabled: bool,
}

impl AuditPublisher {
    /// Create a publisher; `stdout_enabled` also audits process output
    pub fn new(transport: Arc<dyn AuditTransport>, stdout_enabled: bool) -> Self {
        Self {
            transport,
            retry: delivery_retry_config(),
            stdout_enabled,
        }
    }

    /// Whether process output is audited
    pub fn stdout_enabled(&self) -> bool {
        self.stdout_enabled
    }

    /// Deliver one event, retrying with backoff
    pub async fn publish(&self, event: &AuditMsg) -> Result<(), AuditError> {
        let payload =
            serde_json::to_string(event).map_err(|e| AuditError::Encode(e.to_string()))?;

        info!(
            session_id = %event.session_id,
            data_type = %event.data_type,
            "Publishing audit event"
        );

        let transport = self.transport.clone();
        let result = retry_with_backoff(&self.retry, "publish_audit", || {
            let transport = transport.clone();
            let payload = payload.clone();
            async move { transport.send(&payload).await }
        })
        .await;

        if let Err(e) = &result {
            warn!(
                session_id = %event.session_id,
                error = %e,
                "Dropping audit event after final attempt"
            );
        }
        result
    }

    /// Deliver an event in the background
    pub fn spawn_publish(self: &Arc<Self>, event: AuditMsg) -> tokio::task::JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let _ = publisher.publish(&event).await;
        })
    }
}
