//! Browser terminal connections
//!
//! A connection starts with a `bind` frame carrying a session id. Once the
//! session resolves, the socket becomes a [`TerminalBridge`] and the session's
//! shell runs on this task until it exits or the browser goes away.

mod bridge;
mod io;
mod message;

#[cfg(test)]
mod tests;

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

pub use bridge::TerminalBridge;
pub use io::{close_code, TerminalIo};
pub use message::{Op, TerminalMessage};

use crate::audit::AuditPublisher;
use crate::cluster_cache::ClusterConfigCache;
use crate::error::Error;
use crate::exec::ExecLauncher;
use crate::session::SessionRegistry;

/// Services a terminal connection needs
#[derive(Clone)]
pub struct TerminalContext {
    /// Session lookup
    pub registry: Arc<SessionRegistry>,
    /// Cluster client configs
    pub clusters: Arc<ClusterConfigCache>,
    /// Shell launcher
    pub launcher: Arc<ExecLauncher>,
    /// Audit publisher, when auditing is enabled
    pub audit: Option<Arc<AuditPublisher>>,
}

/// Drive one browser terminal connection to completion
pub async fn handle_connection<S, R>(mut sink: S, mut stream: R, ctx: TerminalContext)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let session_id = match await_bind(&mut sink, &mut stream).await {
        Ok(id) => id,
        Err(reason) => {
            debug!(reason = %reason, "Terminal bind failed");
            reject(&mut sink, &reason).await;
            return;
        }
    };

    let Some(info) = ctx.registry.resolve(&session_id).await else {
        warn!(session_id = %session_id, "Bind with unknown session id");
        reject(&mut sink, &Error::SessionNotFound(session_id).to_string()).await;
        return;
    };

    info!(
        session_id = %session_id,
        cluster = %info.cluster_name,
        namespace = %info.namespace,
        pod = %info.pod_name,
        user = %info.user_name,
        "Terminal bound"
    );

    let bridge = Arc::new(TerminalBridge::new(
        sink,
        stream,
        session_id.clone(),
        info.clone(),
        ctx.audit.clone(),
    ));

    // Control sessions already name the cluster their pod was picked on
    let cluster = ctx.clusters.get_config(&info.cluster_name).await;

    let result = match cluster {
        Ok(cluster) => ctx.launcher.launch(&info, &cluster, bridge.clone()).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            info!(session_id = %session_id, "Shell exited");
            bridge.close(close_code::NORMAL, "process exited").await;
        }
        Err(Error::ConnectionClosed) => {
            info!(session_id = %session_id, "Terminal connection closed");
            bridge.close(close_code::NORMAL, "connection closed").await;
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Terminal session failed");
            let reason = e.to_string();
            let _ = bridge.toast(&reason).await;
            bridge.close(close_code::EXEC_FAILED, &reason).await;
        }
    }
}

/// Wait for the first data frame; it must bind a session
async fn await_bind<S, R>(sink: &mut S, stream: &mut R) -> Result<String, String>
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.as_str() == "ping" {
                    let _ = sink.send(Message::Text("pong".into())).await;
                    continue;
                }
                let message = TerminalMessage::parse(text.as_str()).map_err(|e| e.to_string())?;
                if message.op != Op::Bind {
                    return Err(format!("expected bind, got {:?}", message.op));
                }
                if message.session_id.is_empty() {
                    return Err("bind without session id".to_string());
                }
                return Ok(message.session_id);
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => return Err("binary frame before bind".to_string()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                return Err("connection closed before bind".to_string())
            }
        }
    }
}

async fn reject<S>(sink: &mut S, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: close_code::BIND_FAILED,
        reason: bridge::truncate_reason(reason).into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
