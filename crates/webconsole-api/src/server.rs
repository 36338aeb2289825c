//! Broker HTTP server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::{Authorizer, UserResolver};
use crate::error::Error;
use crate::handlers::{
    cloud_shell_handler, create_session_handler, leader_handler, terminal_ws_handler,
};
use crate::kube_client::ClusterClient;
use crate::terminal::TerminalContext;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM file; plain HTTP when unset
    pub tls_cert: Option<PathBuf>,
    /// TLS private key PEM file
    pub tls_key: Option<PathBuf>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Resolves the acting user
    pub users: Arc<dyn UserResolver>,
    /// Namespace access decisions
    pub authorizer: Arc<dyn Authorizer>,
    /// Pod lookups on managed clusters
    pub client: Arc<dyn ClusterClient>,
    /// Session registry, cluster configs and launcher
    pub terminal: TerminalContext,
    /// Whether this instance is the active one
    pub active: Arc<AtomicBool>,
}

/// Build the broker router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/{cluster}/namespace/{namespace}/pod/{pod}/shell/{container}",
            get(create_session_handler),
        )
        .route(
            "/api/v1/{cluster}/pod/{namespace}/{pod}/shell/{container}",
            get(create_session_handler),
        )
        .route(
            "/api/v1/extends/cloudShell/clusters/{cluster}",
            get(cloud_shell_handler),
        )
        .route("/api/ws", get(terminal_ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/leader", get(leader_handler))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn start_server(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let app = router(state);

    let handle = Handle::new();
    let graceful = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        graceful.graceful_shutdown(None);
    });

    let served = match (config.tls_cert, config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(|e| Error::Internal(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, "Starting terminal broker with TLS");
            axum_server::bind_rustls(config.addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        (None, None) => {
            info!(addr = %config.addr, "Starting terminal broker");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        _ => {
            return Err(Error::Internal(
                "TLS needs both a certificate and a key".to_string(),
            ))
        }
    };

    served.map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{MockAuthorizer, MockUserResolver, ResolvedUser};
    use crate::cluster_cache::{CloudShellTarget, ClusterConfigCache, DEFAULT_CLUSTER_CONFIG_TTL};
    use crate::error::ErrorInfo;
    use crate::exec::{ExecLauncher, DEFAULT_SCRIPT};
    use crate::handlers::TerminalResponse;
    use crate::kube_client::MockClusterClient;
    use crate::metadata::{ClusterRecord, MockClusterMetadataSource};
    use crate::session::{ConnectionInfo, SessionRegistry, DEFAULT_SESSION_TTL};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: c
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: ctx
  context:
    cluster: c
    user: u
current-context: ctx
users:
- name: u
  user:
    token: t
"#;

    fn record(name: &str, is_member: bool) -> ClusterRecord {
        ClusterRecord {
            name: name.to_string(),
            kubeconfig: Some(KUBECONFIG.to_string()),
            is_member,
        }
    }

    fn source() -> MockClusterMetadataSource {
        let mut source = MockClusterMetadataSource::new();
        source.expect_get().returning(|name| {
            if name == "unknown" {
                Ok(None)
            } else {
                Ok(Some(record(name, name != "host")))
            }
        });
        source
            .expect_list()
            .returning(|| Ok(vec![record("c1", true), record("host", false)]));
        source
    }

    fn signed_in() -> MockUserResolver {
        let mut users = MockUserResolver::new();
        users.expect_resolve().returning(|_| {
            Some(ResolvedUser {
                username: "alice".into(),
                token: "tok".into(),
            })
        });
        users
    }

    fn allow(allowed: bool) -> MockAuthorizer {
        let mut authorizer = MockAuthorizer::new();
        authorizer
            .expect_authorize()
            .returning(move |_, _, _| Ok(allowed));
        authorizer
    }

    fn state(users: MockUserResolver, authorizer: MockAuthorizer, client: MockClusterClient) -> AppState {
        let client: Arc<dyn ClusterClient> = Arc::new(client);
        AppState {
            users: Arc::new(users),
            authorizer: Arc::new(authorizer),
            client: client.clone(),
            terminal: TerminalContext {
                registry: Arc::new(SessionRegistry::local_only(DEFAULT_SESSION_TTL)),
                clusters: Arc::new(ClusterConfigCache::new(
                    Arc::new(source()),
                    client.clone(),
                    DEFAULT_CLUSTER_CONFIG_TTL,
                    CloudShellTarget::default(),
                )),
                launcher: Arc::new(ExecLauncher::new(client, DEFAULT_SCRIPT)),
                audit: None,
            },
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    fn backend_pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "shell".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn error_code(body: &[u8]) -> String {
        serde_json::from_slice::<ErrorInfo>(body).unwrap().error_code
    }

    const SHELL_URI: &str = "/api/v1/c1/namespace/ns/pod/p1/shell/c?user=dev&platform=portal";

    #[tokio::test]
    async fn test_healthz() {
        let app = router(state(MockUserResolver::new(), MockAuthorizer::new(), MockClusterClient::new()));
        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_leader_reflects_active_flag() {
        let state = state(MockUserResolver::new(), MockAuthorizer::new(), MockClusterClient::new());
        let active = state.active.clone();
        let app = router(state);

        let (status, _) = get(app.clone(), "/leader").await;
        assert_eq!(status, StatusCode::OK);

        active.store(false, Ordering::SeqCst);
        let (status, _) = get(app, "/leader").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_creation_registers_connection_info() {
        let mut client = MockClusterClient::new();
        client
            .expect_pod_exists()
            .withf(|cluster, ns, pod| cluster.name == "c1" && ns == "ns" && pod == "p1")
            .times(1)
            .returning(|_, _, _| Ok(true));
        let state = state(signed_in(), allow(true), client);
        let registry = state.terminal.registry.clone();

        let (status, body) = get(router(state), SHELL_URI).await;
        assert_eq!(status, StatusCode::OK);

        let response: TerminalResponse = serde_json::from_slice(&body).unwrap();
        let info = registry.resolve(&response.id).await.unwrap();
        let mut expected = ConnectionInfo::workload("c1", "ns", "p1", "c", "alice");
        expected.script_user = Some("dev".into());
        expected.audit = Some(crate::session::AuditContext {
            platform: Some("portal".into()),
            ..Default::default()
        });
        assert_eq!(*info, expected);
    }

    #[tokio::test]
    async fn test_legacy_route_creates_session() {
        let mut client = MockClusterClient::new();
        client.expect_pod_exists().returning(|_, _, _| Ok(true));
        let app = router(state(signed_in(), allow(true), client));

        let (status, _) = get(app, "/api/v1/c1/pod/ns/p1/shell/c").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let mut users = MockUserResolver::new();
        users.expect_resolve().returning(|_| None);
        let app = router(state(users, MockAuthorizer::new(), MockClusterClient::new()));

        let (status, body) = get(app, SHELL_URI).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&body), "InvalidToken");
    }

    #[tokio::test]
    async fn test_denied_user_is_rejected() {
        let app = router(state(signed_in(), allow(false), MockClusterClient::new()));

        let (status, body) = get(app, SHELL_URI).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&body), "PermissionDenied");
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let app = router(state(signed_in(), allow(true), MockClusterClient::new()));

        let (status, body) = get(app, "/api/v1/unknown/namespace/ns/pod/p1/shell/c").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(&body), "ClusterInfoNotFound");
    }

    #[tokio::test]
    async fn test_missing_pod() {
        let mut client = MockClusterClient::new();
        client.expect_pod_exists().returning(|_, _, _| Ok(false));
        let state = state(signed_in(), allow(true), client);
        let registry = state.terminal.registry.clone();

        let (status, body) = get(router(state), SHELL_URI).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), "PodNotFound");
        assert_eq!(registry.local_len(), 0);
    }

    #[tokio::test]
    async fn test_cloud_shell_session_targets_backend_pod() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .withf(|cluster, ns, selector| {
                cluster.name == "host"
                    && ns == "kubecube-system"
                    && selector == "kubecube.io/app=kubecube-cloud-shell"
            })
            .returning(|_, _, _| {
                Ok(vec![
                    backend_pod("shell-0", "Pending"),
                    backend_pod("shell-1", "Running"),
                ])
            });
        let state = state(signed_in(), MockAuthorizer::new(), client);
        let registry = state.terminal.registry.clone();

        let (status, body) = get(router(state), "/api/v1/extends/cloudShell/clusters/c1").await;
        assert_eq!(status, StatusCode::OK);

        let response: TerminalResponse = serde_json::from_slice(&body).unwrap();
        let info = registry.resolve(&response.id).await.unwrap();
        assert!(info.is_control_cluster);
        assert_eq!(info.cluster_name, "host");
        assert_eq!(info.namespace, "kubecube-system");
        assert_eq!(info.pod_name, "shell-1");
        assert_eq!(info.container_name, "shell");
        assert_eq!(info.target_cluster.as_deref(), Some("c1"));
        assert_eq!(info.token.as_ref().map(|t| t.expose()), Some("tok"));
    }

    #[tokio::test]
    async fn test_cloud_shell_without_running_pod() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .returning(|_, _, _| Ok(vec![backend_pod("shell-0", "Pending")]));
        let app = router(state(signed_in(), MockAuthorizer::new(), client));

        let (status, body) = get(app, "/api/v1/extends/cloudShell/clusters/c1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(&body), "NoRunningPod");
    }

    #[tokio::test]
    async fn test_cloud_shell_for_unregistered_cluster() {
        let app = router(state(signed_in(), MockAuthorizer::new(), MockClusterClient::new()));

        let (status, body) = get(app, "/api/v1/extends/cloudShell/clusters/unknown").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(&body), "ClusterInfoNotFound");
    }

    #[tokio::test]
    async fn test_inactive_instance_refuses_terminals() {
        let state = state(MockUserResolver::new(), MockAuthorizer::new(), MockClusterClient::new());
        state.active.store(false, Ordering::SeqCst);

        let (status, _) = get(router(state), "/api/ws").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_active_instance_requires_upgrade() {
        let app = router(state(MockUserResolver::new(), MockAuthorizer::new(), MockClusterClient::new()));

        let (status, _) = tokio::time::timeout(Duration::from_secs(5), get(app, "/api/ws"))
            .await
            .unwrap();
        assert_ne!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(status.is_client_error());
    }
}
