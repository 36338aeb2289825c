//! Kubernetes helpers shared by the web console
//!
//! Builds client configs from raw kubeconfig material and inspects pod state.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients.
///
/// Exec streams are long-lived, so this only bounds regular API calls made
/// by clients created with [`config_from_kubeconfig`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a kube `Config` from raw kubeconfig YAML with default timeouts
///
/// `cluster` is only used to give errors useful context.
pub async fn config_from_kubeconfig(cluster: &str, kubeconfig_yaml: &str) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
        .map_err(|e| Error::kubeconfig(cluster, format!("failed to parse kubeconfig: {}", e)))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(cluster, format!("failed to load kubeconfig: {}", e)))?;

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Create a client for the cluster the process runs in
pub async fn in_cluster_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a client from an already-built config
pub fn client_for(cluster: &str, config: &Config) -> Result<Client, Error> {
    Client::try_from(config.clone()).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to create client for {}: {}", cluster, e),
        )
    })
}

/// Returns true if the pod is Running and not explicitly marked NotReady
///
/// A Running pod whose `Ready` condition is missing or unknown is still
/// considered usable.
pub fn is_pod_running(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    if status.phase.as_deref() != Some("Running") {
        return false;
    }

    !status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "False")
        })
        .unwrap_or(false)
}

/// First container name in a pod spec
pub fn first_container_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.as_str())
}
