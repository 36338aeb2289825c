//! Kubernetes Secret backed shared session store
//!
//! Each session is one Secret in the broker namespace, so every broker
//! replica can resolve sessions created by the others. Expiry is an
//! annotation: expired Secrets are ignored on read and removed by
//! [`run_janitor`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{ConnectionInfo, SharedSessionStore};

/// Name prefix of session Secrets
pub const SESSION_SECRET_PREFIX: &str = "webconsole-session-";
/// Label marking session Secrets
pub const SESSION_LABEL: &str = "webconsole.kubecube.io/session";
/// Annotation holding the RFC 3339 expiry time
pub const EXPIRES_AT_ANNOTATION: &str = "webconsole.kubecube.io/expires-at";
/// How often the janitor sweeps expired sessions
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

const CONNECTION_KEY: &str = "connection";

/// Shared session store on Kubernetes Secrets
pub struct SecretSessionStore {
    client: Client,
    namespace: String,
}

impl SecretSessionStore {
    /// Store sessions in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Delete every expired session Secret, returning how many were removed
    pub async fn purge_expired(&self) -> Result<usize> {
        let api = self.api();
        let secrets = api
            .list(&ListParams::default().labels(&format!("{}=true", SESSION_LABEL)))
            .await?;

        let now = Utc::now();
        let mut removed = 0;
        for secret in secrets.items.iter().filter(|s| is_expired(s, now)) {
            let Some(name) = secret.metadata.name.as_deref() else {
                continue;
            };
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => removed += 1,
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(secret = %name, error = %e, "Failed to delete expired session"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SharedSessionStore for SecretSessionStore {
    async fn put(&self, session_id: &str, info: &ConnectionInfo, ttl: Duration) -> Result<()> {
        let secret = session_secret(session_id, info, Utc::now(), ttl)?;
        self.api().create(&PostParams::default(), &secret).await?;
        debug!(session_id = %session_id, "Session written to shared store");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<ConnectionInfo>> {
        let name = secret_name(session_id);
        let api = self.api();
        let Some(secret) = api.get_opt(&name).await? else {
            return Ok(None);
        };

        if is_expired(&secret, Utc::now()) {
            if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
                debug!(session_id = %session_id, error = %e, "Expired session not deleted");
            }
            return Ok(None);
        }

        decode_session(&secret).map(Some)
    }
}

/// Sweep expired sessions every `interval` until `shutdown` fires
pub async fn run_janitor(
    store: std::sync::Arc<SecretSessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(namespace = %store.namespace, "Session janitor started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "Purged expired sessions"),
                    Err(e) => warn!(error = %e, "Session purge failed"),
                }
            }
        }
    }
}

fn secret_name(session_id: &str) -> String {
    format!("{}{}", SESSION_SECRET_PREFIX, session_id)
}

fn session_secret(
    session_id: &str,
    info: &ConnectionInfo,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<Secret> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Internal(format!("session ttl out of range: {}", e)))?;
    let payload = serde_json::to_vec(info)
        .map_err(|e| Error::Internal(format!("failed to encode session: {}", e)))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(session_id)),
            labels: Some(BTreeMap::from([(
                SESSION_LABEL.to_string(),
                "true".to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                EXPIRES_AT_ANNOTATION.to_string(),
                (now + ttl).to_rfc3339(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            CONNECTION_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    })
}

/// Secrets without a readable expiry are treated as expired
fn is_expired(secret: &Secret, now: DateTime<Utc>) -> bool {
    let expires_at = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPIRES_AT_ANNOTATION))
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok());

    match expires_at {
        Some(at) => at.with_timezone(&Utc) <= now,
        None => true,
    }
}

fn decode_session(secret: &Secret) -> Result<ConnectionInfo> {
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(CONNECTION_KEY))
        .ok_or_else(|| Error::Internal("session secret has no connection data".to_string()))?;
    serde_json::from_slice(&payload.0)
        .map_err(|e| Error::Internal(format!("corrupt session secret: {}", e)))
}
