//! Per-cluster client configuration cache
//!
//! Building a client config means reading the `Cluster` resource and parsing
//! its kubeconfig, so results are cached with a fixed TTL and evicted lazily
//! on read. Failed lookups are never cached. Two requests missing at the same
//! time may both fetch; the later insert wins.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use webconsole_common::kube_utils::config_from_kubeconfig;
use webconsole_common::{CLOUD_SHELL_LABEL_KEY, WEBCONSOLE_SYSTEM_NAMESPACE};

use crate::error::{Error, Result};
use crate::kube_client::ClusterClient;
use crate::metadata::{ClusterMetadataSource, ClusterRecord};

/// How long a built config stays cached
pub const DEFAULT_CLUSTER_CONFIG_TTL: Duration = Duration::from_secs(5 * 60);

/// Default cloud-shell backend deployment
pub const DEFAULT_CLOUD_SHELL_DEPLOYMENT: &str = "kubecube-cloud-shell";

/// Cache key for the discovered control cluster
///
/// `@` cannot appear in a Kubernetes object name.
const CONTROL_CLUSTER_KEY: &str = "@control";

/// Client configuration for one cluster
#[derive(Clone)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// kube-rs client config
    pub config: kube::Config,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("name", &self.name)
            .field("cluster_url", &self.config.cluster_url.to_string())
            .finish()
    }
}

struct CachedClusterConfig {
    config: Arc<ClusterConfig>,
    expires_at: Instant,
}

/// Where the cloud-shell backend pods live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudShellTarget {
    /// Namespace of the backend deployment
    pub namespace: String,
    /// Deployment name, matched through the app label
    pub deployment: String,
}

impl CloudShellTarget {
    /// Label selector matching the backend pods
    pub fn label_selector(&self) -> String {
        format!("{}={}", CLOUD_SHELL_LABEL_KEY, self.deployment)
    }
}

impl Default for CloudShellTarget {
    fn default() -> Self {
        Self {
            namespace: WEBCONSOLE_SYSTEM_NAMESPACE.to_string(),
            deployment: DEFAULT_CLOUD_SHELL_DEPLOYMENT.to_string(),
        }
    }
}

/// Cluster config cache
pub struct ClusterConfigCache {
    source: Arc<dyn ClusterMetadataSource>,
    client: Arc<dyn ClusterClient>,
    entries: DashMap<String, CachedClusterConfig>,
    ttl: Duration,
    cloud_shell: CloudShellTarget,
}

impl ClusterConfigCache {
    /// Create a cache
    pub fn new(
        source: Arc<dyn ClusterMetadataSource>,
        client: Arc<dyn ClusterClient>,
        ttl: Duration,
        cloud_shell: CloudShellTarget,
    ) -> Self {
        Self {
            source,
            client,
            entries: DashMap::new(),
            ttl,
            cloud_shell,
        }
    }

    /// Where cloud-shell backend pods are looked up
    pub fn cloud_shell(&self) -> &CloudShellTarget {
        &self.cloud_shell
    }

    /// Client config for a registered cluster
    pub async fn get_config(&self, cluster: &str) -> Result<Arc<ClusterConfig>> {
        if let Some(config) = self.cached(cluster) {
            return Ok(config);
        }

        let record = match self.source.get(cluster).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(cluster = %cluster, "Cluster is not registered");
                return Err(Error::ClusterInfoNotFound(cluster.to_string()));
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cluster metadata lookup failed");
                return Err(Error::ClusterInfoNotFound(cluster.to_string()));
            }
        };

        let config = build_cluster_config(&record).await?;
        self.insert(cluster, config.clone());
        Ok(config)
    }

    /// Client config for the cluster hosting the cloud-shell backend
    ///
    /// Probes registered clusters, non-member clusters first, for a pod of
    /// the backend deployment.
    pub async fn control_config(&self) -> Result<Arc<ClusterConfig>> {
        if let Some(config) = self.cached(CONTROL_CLUSTER_KEY) {
            return Ok(config);
        }

        let mut records = self.source.list().await.map_err(|e| {
            warn!(error = %e, "Failed to list registered clusters");
            Error::ControlClusterNotFound(e.to_string())
        })?;
        records.sort_by_key(|r| r.is_member);

        let selector = self.cloud_shell.label_selector();
        for record in &records {
            let config = match build_cluster_config(record).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(cluster = %record.name, error = %e, "Skipping cluster with unusable config");
                    continue;
                }
            };

            match self
                .client
                .list_pods(&config, &self.cloud_shell.namespace, &selector)
                .await
            {
                Ok(pods) if !pods.is_empty() => {
                    info!(
                        cluster = %record.name,
                        deployment = %self.cloud_shell.deployment,
                        "Found cloud-shell control cluster"
                    );
                    self.insert(CONTROL_CLUSTER_KEY, config.clone());
                    return Ok(config);
                }
                Ok(_) => {
                    debug!(cluster = %record.name, "No cloud-shell pods on cluster");
                }
                Err(e) => {
                    warn!(cluster = %record.name, error = %e, "Failed to probe cluster for cloud-shell pods");
                }
            }
        }

        Err(Error::ControlClusterNotFound(format!(
            "no registered cluster runs {}/{}",
            self.cloud_shell.namespace, self.cloud_shell.deployment
        )))
    }

    fn cached(&self, key: &str) -> Option<Arc<ClusterConfig>> {
        let expired = {
            let entry = self.entries.get(key)?;
            if Instant::now() < entry.expires_at {
                return Some(entry.config.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn insert(&self, key: &str, config: Arc<ClusterConfig>) {
        self.entries.insert(
            key.to_string(),
            CachedClusterConfig {
                config,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

async fn build_cluster_config(record: &ClusterRecord) -> Result<Arc<ClusterConfig>> {
    let kubeconfig = record
        .kubeconfig
        .as_deref()
        .ok_or_else(|| Error::ConfigConstructionFailed {
            cluster: record.name.clone(),
            message: "cluster has no kubeconfig".to_string(),
        })?;

    let config = config_from_kubeconfig(&record.name, kubeconfig).await?;
    Ok(Arc::new(ClusterConfig {
        name: record.name.clone(),
        config,
    }))
}
