//! Cluster Custom Resource Definition
//!
//! The web console does not own this resource. It reads `Cluster` objects
//! registered by the KubeCube control plane to learn how to reach each
//! managed cluster.

use k8s_openapi::ByteString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Specification for a registered cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.kubecube.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    namespaced = false,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Raw kubeconfig used to reach the cluster's API server
    #[serde(default)]
    pub kubeconfig: Option<ByteString>,

    /// Whether this is a member cluster (false for the pivot/control cluster)
    #[serde(default)]
    pub is_member_cluster: bool,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClusterSpec {
    /// Kubeconfig as UTF-8 text, if present and valid
    pub fn kubeconfig_text(&self) -> Option<&str> {
        self.kubeconfig
            .as_ref()
            .and_then(|b| std::str::from_utf8(&b.0).ok())
    }
}
