//! Active-instance election on a Kubernetes Lease
//!
//! Replicas compete for one `coordination.k8s.io/v1` Lease. The holder is the
//! active instance: it reports ready on `/leader` and serves terminals, so
//! the Service only routes browsers to it. Writes carry the lease's
//! resourceVersion, so two replicas racing for an expired lease cannot both
//! win; the loser gets 409 Conflict and waits for the next round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease contended by web console replicas
pub const LEADER_LEASE_NAME: &str = "kubecube-webconsole-leader";

const LEASE_DURATION: Duration = Duration::from_secs(15);
/// A leader that cannot renew for this long steps down
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Leader election errors
#[derive(Debug, thiserror::Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Competes for the leader lease and publishes the outcome to a flag
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector; `identity` is usually the pod name
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Keep `active` in sync with lease ownership until `shutdown` fires
    ///
    /// On shutdown a held lease is released so a standby can take over
    /// without waiting for expiry.
    pub async fn run(&self, active: Arc<AtomicBool>, shutdown: CancellationToken) {
        info!(identity = %self.identity, lease = %self.lease_name, "Starting leader election");
        let mut last_renewed: Option<Instant> = None;

        loop {
            let held = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renewed = Some(Instant::now());
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease update failed");
                    // Ride out transient API errors until the renew deadline
                    last_renewed.is_some_and(|at| at.elapsed() < RENEW_DEADLINE)
                }
            };
            if !held {
                last_renewed = None;
            }

            let was_active = active.swap(held, Ordering::SeqCst);
            if held != was_active {
                if held {
                    info!(identity = %self.identity, "Became active instance");
                } else {
                    warn!(identity = %self.identity, "No longer the active instance");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }

        if active.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.release().await {
                warn!(identity = %self.identity, error = %e, "Failed to release lease");
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(existing) = api.get_opt(&self.lease_name).await? else {
            let lease = self.lease(None, now, 0);
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

        let lease = if holder == Some(self.identity.as_str()) {
            let mut renewed = existing.clone();
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
            }
            renewed
        } else if lease_expired(spec, now) {
            let version = existing
                .metadata
                .resource_version
                .clone()
                .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;
            debug!(identity = %self.identity, previous = ?holder, "Taking over expired lease");
            self.lease(Some(version), now, transitions + 1)
        } else {
            return Ok(false);
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(mut lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };

        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;

        api.replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }

    fn lease(&self, resource_version: Option<String>, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Whether a lease may be taken over at `now`
///
/// A lease without a holder, renew time or duration is free.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => now > renewed.0 + chrono::Duration::seconds(seconds as i64),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, renewed: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(renewed)),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_lease_is_held() {
        let now = Utc::now();
        let spec = spec(Some("pod-a"), now - chrono::Duration::seconds(5));
        assert!(!lease_expired(Some(&spec), now));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        let now = Utc::now();
        let spec = spec(Some("pod-a"), now - chrono::Duration::seconds(16));
        assert!(lease_expired(Some(&spec), now));
    }

    #[test]
    fn test_released_lease_is_free() {
        let now = Utc::now();
        assert!(lease_expired(Some(&spec(None, now)), now));
        assert!(lease_expired(Some(&spec(Some(""), now)), now));
        assert!(lease_expired(None, now));
    }

    #[test]
    fn test_lease_without_renew_time_is_free() {
        let spec = LeaseSpec {
            holder_identity: Some("pod-a".into()),
            ..Default::default()
        };
        assert!(lease_expired(Some(&spec), Utc::now()));
    }
}
