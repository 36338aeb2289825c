//! Cluster metadata source
//!
//! Registered clusters are `Cluster` custom resources on the cluster the
//! broker runs in. Each one carries the kubeconfig used to reach it.

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;
use webconsole_common::crd::Cluster;

use crate::error::Result;

/// What the broker needs to know about a registered cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    /// Cluster name
    pub name: String,
    /// Kubeconfig YAML, if the resource carries one
    pub kubeconfig: Option<String>,
    /// Member clusters never host the cloud-shell backend
    pub is_member: bool,
}

impl From<&Cluster> for ClusterRecord {
    fn from(cluster: &Cluster) -> Self {
        Self {
            name: cluster.metadata.name.clone().unwrap_or_default(),
            kubeconfig: cluster.spec.kubeconfig_text().map(str::to_string),
            is_member: cluster.spec.is_member_cluster,
        }
    }
}

/// Lookup of registered clusters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterMetadataSource: Send + Sync {
    /// Fetch one cluster; `Ok(None)` if it is not registered
    async fn get(&self, name: &str) -> Result<Option<ClusterRecord>>;

    /// Every registered cluster
    async fn list(&self) -> Result<Vec<ClusterRecord>>;
}

/// Reads `Cluster` resources through the in-cluster client
pub struct CrdClusterSource {
    client: Client,
}

impl CrdClusterSource {
    /// Create a source backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterMetadataSource for CrdClusterSource {
    async fn get(&self, name: &str) -> Result<Option<ClusterRecord>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let cluster = api.get_opt(name).await?;
        debug!(cluster = %name, found = cluster.is_some(), "Looked up cluster resource");
        Ok(cluster.as_ref().map(ClusterRecord::from))
    }

    async fn list(&self) -> Result<Vec<ClusterRecord>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let clusters = api.list(&ListParams::default()).await?;
        Ok(clusters.items.iter().map(ClusterRecord::from).collect())
    }
}
