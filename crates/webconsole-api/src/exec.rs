//! Remote shell launcher
//!
//! Picks the command for a session and runs it through the cluster client.
//! Workload containers without bash get one retry with `/bin/sh`.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster_cache::ClusterConfig;
use crate::error::{Error, Result};
use crate::kube_client::ClusterClient;
use crate::session::ConnectionInfo;
use crate::terminal::TerminalIo;

/// Shell tried first when no script parameters are given
pub const PRIMARY_SHELL: &str = "/bin/bash";
/// Shell tried once when the primary command fails
pub const FALLBACK_SHELL: &str = "/bin/sh";
/// Default in-container login script
pub const DEFAULT_SCRIPT: &str = "/init.sh";
/// Entry point of cloud-shell backend pods
pub const CONTROL_SCRIPT: &str = "/kubecube-chroot.sh";

/// Starts shells for bound sessions
pub struct ExecLauncher {
    client: Arc<dyn ClusterClient>,
    script: String,
}

impl ExecLauncher {
    /// Create a launcher; `script` runs when script parameters are present
    pub fn new(client: Arc<dyn ClusterClient>, script: impl Into<String>) -> Self {
        Self {
            client,
            script: script.into(),
        }
    }

    /// Command for a session
    pub fn command_for(&self, info: &ConnectionInfo) -> Result<Vec<String>> {
        if info.is_control_cluster {
            let target = info.target_cluster.as_deref().ok_or_else(|| {
                Error::Internal("cloud-shell session has no target cluster".to_string())
            })?;
            let token = info
                .token
                .as_ref()
                .ok_or_else(|| Error::Internal("cloud-shell session has no token".to_string()))?;
            return Ok(vec![
                CONTROL_SCRIPT.to_string(),
                "-u".to_string(),
                info.user_name.clone(),
                "-c".to_string(),
                target.to_string(),
                "-t".to_string(),
                token.expose().to_string(),
            ]);
        }

        let params = [
            ("-u", &info.script_user),
            ("-i", &info.script_uid),
            ("-a", &info.script_user_auth),
        ];
        if params.iter().all(|(_, v)| v.is_none()) {
            return Ok(vec![PRIMARY_SHELL.to_string()]);
        }

        let mut command = vec![self.script.clone()];
        for (flag, value) in params {
            if let Some(value) = value {
                command.push(flag.to_string());
                command.push(value.clone());
            }
        }
        Ok(command)
    }

    /// Run the session's shell until it exits or the terminal closes
    pub async fn launch(
        &self,
        info: &ConnectionInfo,
        cluster: &ClusterConfig,
        terminal: Arc<dyn TerminalIo>,
    ) -> Result<()> {
        let command = self.command_for(info)?;
        info!(
            cluster = %cluster.name,
            namespace = %info.namespace,
            pod = %info.pod_name,
            container = %info.container_name,
            user = %info.user_name,
            program = %command[0],
            "Launching shell"
        );

        let primary = self
            .client
            .exec(cluster, info, command, terminal.clone())
            .await;

        match primary {
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) if !info.is_control_cluster => {
                warn!(
                    namespace = %info.namespace,
                    pod = %info.pod_name,
                    error = %e,
                    "Primary shell failed, falling back to {}",
                    FALLBACK_SHELL
                );
                self.client
                    .exec(cluster, info, vec![FALLBACK_SHELL.to_string()], terminal)
                    .await
            }
            other => other,
        }
    }
}
