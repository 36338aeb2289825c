//! Kubernetes operations against managed clusters
//!
//! Everything the broker does on a managed cluster goes through
//! [`ClusterClient`]: pod lookups for authorization checks, backend pod
//! discovery for cloud shell, and the interactive exec stream itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams, TerminalSize};
use kube::Client;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use webconsole_common::kube_utils::{client_for, is_pod_running};

use crate::cluster_cache::ClusterConfig;
use crate::error::{Error, Result};
use crate::session::ConnectionInfo;
use crate::terminal::TerminalIo;

/// Read size for process output
const STDOUT_BUF_SIZE: usize = 4096;
/// Read size for browser keystrokes
const STDIN_BUF_SIZE: usize = 4096;

/// Operations on a managed cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Whether `pod` exists in `namespace`
    async fn pod_exists(&self, cluster: &ClusterConfig, namespace: &str, pod: &str)
        -> Result<bool>;

    /// Pods in `namespace` matching `label_selector`
    async fn list_pods(
        &self,
        cluster: &ClusterConfig,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>>;

    /// Run `command` with a TTY in the session's container, streaming through
    /// `terminal` until the process exits or the terminal closes
    ///
    /// Returns `Ok` when the process ran and exited (whatever its exit code),
    /// [`Error::ConnectionClosed`] when the browser went away, and
    /// [`Error::RemoteExecFailed`] when the command could not start or stream.
    async fn exec(
        &self,
        cluster: &ClusterConfig,
        info: &ConnectionInfo,
        command: Vec<String>,
        terminal: Arc<dyn TerminalIo>,
    ) -> Result<()>;
}

/// [`ClusterClient`] backed by kube-rs
#[derive(Clone, Default)]
pub struct KubeClusterClient;

impl KubeClusterClient {
    fn client(cluster: &ClusterConfig) -> Result<Client> {
        Ok(client_for(&cluster.name, &cluster.config)?)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn pod_exists(
        &self,
        cluster: &ClusterConfig,
        namespace: &str,
        pod: &str,
    ) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(Self::client(cluster)?, namespace);
        Ok(pods.get_opt(pod).await?.is_some())
    }

    async fn list_pods(
        &self,
        cluster: &ClusterConfig,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(Self::client(cluster)?, namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn exec(
        &self,
        cluster: &ClusterConfig,
        info: &ConnectionInfo,
        command: Vec<String>,
        terminal: Arc<dyn TerminalIo>,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(Self::client(cluster)?, &info.namespace);
        let params = AttachParams::interactive_tty().container(info.container_name.clone());

        debug!(
            cluster = %cluster.name,
            namespace = %info.namespace,
            pod = %info.pod_name,
            command = ?command,
            "Starting exec"
        );

        let mut attached = pods
            .exec(&info.pod_name, command, &params)
            .await
            .map_err(|e| {
                Error::RemoteExecFailed(format!(
                    "exec into {}/{} failed: {}",
                    info.namespace, info.pod_name, e
                ))
            })?;

        info!(
            cluster = %cluster.name,
            namespace = %info.namespace,
            pod = %info.pod_name,
            container = %info.container_name,
            "Exec stream established"
        );

        let stdin = attached.stdin();
        let status = attached.take_status();

        let stdout_task = attached
            .stdout()
            .map(|stdout| tokio::spawn(pump_stdout(stdout, terminal.clone())));
        let resize_task = attached
            .terminal_size()
            .map(|tx| tokio::spawn(pump_resize(tx, terminal.clone())));

        let status = async move {
            match status {
                Some(status) => status.await,
                None => None,
            }
        };
        tokio::pin!(status);

        let result = match stdin {
            Some(stdin) => {
                tokio::select! {
                    end = pump_stdin(stdin, terminal.as_ref()) => match end {
                        StdinEnd::TerminalClosed => Err(Error::ConnectionClosed),
                        StdinEnd::Failed(e) => Err(e),
                        StdinEnd::ProcessGone => exec_status_result((&mut status).await),
                    },
                    status = &mut status => exec_status_result(status),
                }
            }
            None => exec_status_result((&mut status).await),
        };

        if let Some(task) = resize_task {
            task.abort();
        }
        match (&result, stdout_task) {
            // Let trailing output drain after a normal exit
            (Ok(()), Some(task)) => {
                let _ = task.await;
            }
            (_, Some(task)) => task.abort(),
            (_, None) => {}
        }

        result
    }
}

enum StdinEnd {
    TerminalClosed,
    ProcessGone,
    Failed(Error),
}

/// Copy browser keystrokes into the process
///
/// Protocol errors only affect the frame that caused them.
async fn pump_stdin<W: AsyncWrite + Unpin>(mut stdin: W, terminal: &dyn TerminalIo) -> StdinEnd {
    let mut buf = vec![0u8; STDIN_BUF_SIZE];
    loop {
        match terminal.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => {
                if let Err(e) = stdin.write_all(&buf[..n]).await {
                    debug!(error = %e, "Exec stdin closed");
                    return StdinEnd::ProcessGone;
                }
                let _ = stdin.flush().await;
            }
            Err(Error::ProtocolViolation(reason)) => {
                warn!(reason = %reason, "Ignoring malformed terminal frame");
            }
            Err(Error::ConnectionClosed) => return StdinEnd::TerminalClosed,
            Err(e) => return StdinEnd::Failed(e),
        }
    }
}

/// Copy process output to the browser
async fn pump_stdout<R: AsyncRead + Unpin>(mut stdout: R, terminal: Arc<dyn TerminalIo>) {
    let mut buf = vec![0u8; STDOUT_BUF_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if terminal.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Exec stdout ended with error");
                break;
            }
        }
    }
}

/// Forward window size changes to the process
async fn pump_resize(
    mut tx: futures::channel::mpsc::Sender<TerminalSize>,
    terminal: Arc<dyn TerminalIo>,
) {
    while let Some(size) = terminal.next_resize().await {
        if tx.send(size).await.is_err() {
            break;
        }
    }
}

/// Interpret the exec status reported when the stream ends
///
/// A missing status means the stream closed without a verdict, which the API
/// server does for a clean exit.
pub fn exec_status_result(status: Option<Status>) -> Result<()> {
    let Some(status) = status else {
        return Ok(());
    };

    if status.status.as_deref() == Some("Success")
        || status.reason.as_deref() == Some("NonZeroExitCode")
    {
        return Ok(());
    }

    Err(Error::RemoteExecFailed(
        status
            .message
            .unwrap_or_else(|| "remote command failed".to_string()),
    ))
}

/// Pick a random pod that is Running and not marked NotReady
pub fn pick_running_pod(pods: &[Pod]) -> Option<&Pod> {
    let running: Vec<&Pod> = pods.iter().filter(|p| is_pod_running(p)).collect();
    running.choose(&mut rand::thread_rng()).copied()
}
