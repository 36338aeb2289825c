//! Web console terminal broker

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgAction, Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webconsole_api::audit::parse_header_pair;
use webconsole_api::cluster_cache::{DEFAULT_CLOUD_SHELL_DEPLOYMENT, DEFAULT_CLUSTER_CONFIG_TTL};
use webconsole_api::exec::DEFAULT_SCRIPT;
use webconsole_api::session::DEFAULT_SESSION_TTL;
use webconsole_api::session_store::JANITOR_INTERVAL;
use webconsole_api::{
    run_janitor, start_server, AppState, AuditPublisher, CloudShellTarget, ClusterConfigCache,
    CrdClusterSource, ExecLauncher, HttpAuditTransport, HttpAuthorizer, JwtUserResolver,
    KubeClusterClient, SecretSessionStore, ServerConfig, SessionRegistry, TerminalContext,
};
use webconsole_common::kube_utils::in_cluster_client;
use webconsole_common::leader_election::LeaderElector;
use webconsole_common::telemetry::{init_telemetry, TelemetryConfig};
use webconsole_common::{DEFAULT_SERVER_PORT, WEBCONSOLE_SYSTEM_NAMESPACE};

/// Where sessions are shared between replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SessionStoreKind {
    /// Sessions live only in this process
    None,
    /// Sessions are mirrored into Secrets in the broker namespace
    Secret,
}

/// Web terminal broker for containers in multi-cluster Kubernetes
#[derive(Parser, Debug)]
#[command(name = "webconsole", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(
        long,
        env = "WEBCONSOLE_LISTEN",
        default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT))
    )]
    listen: SocketAddr,

    /// TLS certificate PEM file; serves plain HTTP when unset
    #[arg(long, env = "WEBCONSOLE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key PEM file
    #[arg(long, env = "WEBCONSOLE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Script run in the container when user parameters are present
    #[arg(long, default_value = DEFAULT_SCRIPT)]
    script: String,

    /// Deployment backing the cloud shell
    #[arg(long, default_value = DEFAULT_CLOUD_SHELL_DEPLOYMENT)]
    cloud_shell_deployment: String,

    /// Namespace of the cloud-shell deployment
    #[arg(long, default_value = WEBCONSOLE_SYSTEM_NAMESPACE)]
    cloud_shell_namespace: String,

    /// Namespace the broker keeps its lease and session Secrets in
    #[arg(long, env = "POD_NAMESPACE", default_value = WEBCONSOLE_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Audit terminal input
    #[arg(long, env = "AUDIT_ENABLED")]
    audit: bool,

    /// Also audit terminal output
    #[arg(long, env = "AUDIT_STDOUT")]
    audit_stdout: bool,

    /// Audit collector URL
    #[arg(long, env = "AUDIT_URL")]
    audit_url: Option<String>,

    /// HTTP method for audit delivery
    #[arg(long, env = "AUDIT_METHOD", default_value = "POST")]
    audit_method: String,

    /// Extra audit request header as `Name=Value`; repeatable
    #[arg(long = "audit-header", value_parser = parse_header_pair)]
    audit_headers: Vec<(String, String)>,

    /// HS256 secret for platform tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Authorization service address (`host:port`)
    #[arg(long, env = "KUBECUBE_SVC", default_value = "kubecube:7443")]
    kubecube_svc: String,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL.as_secs())]
    session_ttl_secs: u64,

    /// Cluster config cache lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_CLUSTER_CONFIG_TTL.as_secs())]
    cluster_config_ttl_secs: u64,

    /// Shared session store
    #[arg(long, value_enum, default_value_t = SessionStoreKind::None)]
    session_store: SessionStoreKind,

    /// Compete for the leader lease; when off this instance is always active
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    leader_election: bool,

    /// Identity used in the leader lease
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client or server is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let client = in_cluster_client()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let session_ttl = Duration::from_secs(cli.session_ttl_secs);
    let registry = match cli.session_store {
        SessionStoreKind::None => SessionRegistry::local_only(session_ttl),
        SessionStoreKind::Secret => {
            let store = Arc::new(SecretSessionStore::new(client.clone(), cli.namespace.clone()));
            tokio::spawn(run_janitor(store.clone(), JANITOR_INTERVAL, shutdown.clone()));
            SessionRegistry::with_shared_store(store, session_ttl)
        }
    };

    let audit = if cli.audit {
        let url = cli
            .audit_url
            .as_deref()
            .context("--audit-url is required when auditing is enabled")?;
        let transport = HttpAuditTransport::new(url, &cli.audit_method, &cli.audit_headers)
            .context("Invalid audit configuration")?;
        info!(url = %url, stdout = cli.audit_stdout, "Terminal auditing enabled");
        Some(Arc::new(AuditPublisher::new(
            Arc::new(transport),
            cli.audit_stdout,
        )))
    } else {
        None
    };

    let cluster_client = Arc::new(KubeClusterClient);
    let clusters = ClusterConfigCache::new(
        Arc::new(CrdClusterSource::new(client.clone())),
        cluster_client.clone(),
        Duration::from_secs(cli.cluster_config_ttl_secs),
        CloudShellTarget {
            namespace: cli.cloud_shell_namespace.clone(),
            deployment: cli.cloud_shell_deployment.clone(),
        },
    );

    let active = Arc::new(AtomicBool::new(!cli.leader_election));
    let elector = if cli.leader_election {
        let identity = cli
            .pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .context("--pod-name or HOSTNAME is required for leader election")?;
        let elector = LeaderElector::new(client.clone(), &cli.namespace, &identity);
        let (active, shutdown) = (active.clone(), shutdown.clone());
        Some(tokio::spawn(async move { elector.run(active, shutdown).await }))
    } else {
        warn!("Leader election disabled, serving as the active instance");
        None
    };

    let state = AppState {
        users: Arc::new(JwtUserResolver::new(cli.jwt_secret.as_bytes())),
        authorizer: Arc::new(HttpAuthorizer::new(&cli.kubecube_svc)?),
        client: cluster_client.clone(),
        terminal: TerminalContext {
            registry: Arc::new(registry),
            clusters: Arc::new(clusters),
            launcher: Arc::new(ExecLauncher::new(cluster_client, cli.script.clone())),
            audit,
        },
        active,
    };

    let config = ServerConfig {
        addr: cli.listen,
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
    };
    let served = start_server(config, state, shutdown.clone()).await;

    // Give the lease up before exiting so a standby takes over at once
    shutdown.cancel();
    if let Some(elector) = elector {
        let _ = elector.await;
    }

    served?;
    info!("Terminal broker stopped");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
