//! HTTP handlers
//!
//! Session creation hands back an opaque id; the browser then opens
//! `/api/ws` and binds to it. Only the active instance accepts terminals.

use std::sync::atomic::Ordering;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use webconsole_common::kube_utils::first_container_name;

use crate::auth::ResolvedUser;
use crate::error::{Error, Result};
use crate::kube_client::pick_running_pod;
use crate::server::AppState;
use crate::session::{AuditContext, ConnectionInfo, SecretToken};
use crate::terminal::handle_connection;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Path of the session-creation routes
#[derive(Debug, Clone, Deserialize)]
pub struct ShellPath {
    /// Target cluster
    pub cluster: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
}

/// Query parameters of the session-creation routes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellQuery {
    /// User the in-container script switches to
    #[serde(default)]
    pub user: Option<String>,
    /// Uid the in-container script switches to
    #[serde(default)]
    pub uid: Option<String>,
    /// Permission level for the in-container script
    #[serde(default)]
    pub auth: Option<String>,
    /// Client address reported by the caller
    #[serde(default)]
    pub remote_ip: Option<String>,
    /// Client user agent reported by the caller
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Originating platform
    #[serde(default)]
    pub platform: Option<String>,
    /// Web user on the originating platform
    #[serde(default)]
    pub web_user: Option<String>,
}

/// Reply carrying a new session id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalResponse {
    /// Session id to bind with
    pub id: String,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Audit context from the query, with request headers as fallback
pub fn audit_context(query: &ShellQuery, headers: &HeaderMap) -> Option<AuditContext> {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next());
    let agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());

    let context = AuditContext {
        remote_ip: non_empty(query.remote_ip.as_deref()).or_else(|| non_empty(forwarded)),
        user_agent: non_empty(query.user_agent.as_deref()).or_else(|| non_empty(agent)),
        web_user: non_empty(query.web_user.as_deref()),
        platform: non_empty(query.platform.as_deref()),
    };
    (context != AuditContext::default()).then_some(context)
}

/// Connection info for a workload pod session
pub fn build_connection_info(
    path: &ShellPath,
    query: &ShellQuery,
    user: &ResolvedUser,
    headers: &HeaderMap,
) -> ConnectionInfo {
    let mut info = ConnectionInfo::workload(
        &path.cluster,
        &path.namespace,
        &path.pod,
        &path.container,
        &user.username,
    );
    info.script_user = non_empty(query.user.as_deref());
    info.script_uid = non_empty(query.uid.as_deref());
    info.script_user_auth = non_empty(query.auth.as_deref());
    info.audit = audit_context(query, headers);
    info
}

/// Handle GET `/api/v1/{cluster}/namespace/{namespace}/pod/{pod}/shell/{container}`
pub async fn create_session_handler(
    State(state): State<AppState>,
    Path(path): Path<ShellPath>,
    Query(query): Query<ShellQuery>,
    headers: HeaderMap,
) -> Result<Json<TerminalResponse>> {
    create_session(&state, &path, &query, &headers)
        .await
        .map(|id| Json(TerminalResponse { id }))
        .inspect_err(|e| {
            error!(
                cluster = %path.cluster,
                namespace = %path.namespace,
                pod = %path.pod,
                error = %e,
                "Session creation failed"
            )
        })
}

async fn create_session(
    state: &AppState,
    path: &ShellPath,
    query: &ShellQuery,
    headers: &HeaderMap,
) -> Result<String> {
    let user = state
        .users
        .resolve(headers)
        .ok_or_else(|| Error::InvalidToken("missing or invalid bearer token".to_string()))?;

    if !state
        .authorizer
        .authorize(&user.username, &path.namespace, &path.cluster)
        .await?
    {
        return Err(Error::PermissionDenied(format!(
            "user {} may not open shells in {}",
            user.username, path.namespace
        )));
    }

    let cluster = state.terminal.clusters.get_config(&path.cluster).await?;
    if !state
        .client
        .pod_exists(&cluster, &path.namespace, &path.pod)
        .await?
    {
        return Err(Error::PodNotFound {
            namespace: path.namespace.clone(),
            pod: path.pod.clone(),
        });
    }

    let info = build_connection_info(path, query, &user, headers);
    let id = state.terminal.registry.create_session(info).await?;
    info!(
        session_id = %id,
        cluster = %path.cluster,
        namespace = %path.namespace,
        pod = %path.pod,
        user = %user.username,
        "Terminal session created"
    );
    Ok(id.to_string())
}

/// Handle GET `/api/v1/extends/cloudShell/clusters/{cluster}`
pub async fn cloud_shell_handler(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Query(query): Query<ShellQuery>,
    headers: HeaderMap,
) -> Result<Json<TerminalResponse>> {
    create_cloud_shell(&state, &cluster, &query, &headers)
        .await
        .map(|id| Json(TerminalResponse { id }))
        .inspect_err(|e| error!(cluster = %cluster, error = %e, "Cloud shell creation failed"))
}

async fn create_cloud_shell(
    state: &AppState,
    target: &str,
    query: &ShellQuery,
    headers: &HeaderMap,
) -> Result<String> {
    let user = state
        .users
        .resolve(headers)
        .ok_or_else(|| Error::InvalidToken("missing or invalid bearer token".to_string()))?;

    let clusters = &state.terminal.clusters;
    // Target must be registered even though the shell runs elsewhere
    clusters.get_config(target).await?;
    let control = clusters.control_config().await?;

    let backend = clusters.cloud_shell();
    let pods = state
        .client
        .list_pods(&control, &backend.namespace, &backend.label_selector())
        .await?;
    let pod = pick_running_pod(&pods).ok_or_else(|| {
        Error::NoRunningPod(format!("{}/{}", backend.namespace, backend.deployment))
    })?;

    let pod_name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Internal("cloud-shell pod has no name".to_string()))?;
    let container = first_container_name(pod)
        .map(str::to_string)
        .ok_or_else(|| Error::NoRunningPod(format!("pod {} has no containers", pod_name)))?;

    let mut info = ConnectionInfo::workload(
        &control.name,
        &backend.namespace,
        &pod_name,
        container,
        &user.username,
    );
    info.is_control_cluster = true;
    info.target_cluster = Some(target.to_string());
    info.token = Some(SecretToken::new(user.token));
    info.audit = audit_context(query, headers);

    let id = state.terminal.registry.create_session(info).await?;
    info!(
        session_id = %id,
        cluster = %target,
        control_cluster = %control.name,
        pod = %pod_name,
        user = %user.username,
        "Cloud shell session created"
    );
    Ok(id.to_string())
}

/// Handle GET `/api/ws`
///
/// Inactive instances refuse before looking at the upgrade.
pub async fn terminal_ws_handler(
    State(state): State<AppState>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.active.load(Ordering::SeqCst) {
        debug!("Refusing terminal on inactive instance");
        return (StatusCode::SERVICE_UNAVAILABLE, "inactive instance").into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(error = %rejection, "Terminal upgrade rejected");
            return rejection.into_response();
        }
    };

    let ctx = state.terminal.clone();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        handle_connection(sink, stream, ctx).await;
    })
}

/// Handle GET `/leader`
pub async fn leader_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.active.load(Ordering::SeqCst) {
        (StatusCode::OK, "leader")
    } else {
        (StatusCode::BAD_REQUEST, "not leader")
    }
}
