//! Web console terminal broker
//!
//! Hands browsers an interactive shell in containers on managed clusters
//! without giving them credentials for those clusters. A caller first creates
//! a session over HTTP and gets back an opaque id, then opens a WebSocket,
//! binds to the id and talks a small JSON protocol that the broker relays to
//! the cluster's exec stream.
//!
//! # Architecture
//!
//! ```text
//! browser ──► session API ──► authz ──► SessionRegistry
//!    │
//!    └──ws──► TerminalBridge ◄──► ExecLauncher ──► kube exec
//!                  │
//!                  └──► AuditPublisher ──► collector
//! ```
//!
//! # Endpoints
//!
//! - `GET /api/v1/{cluster}/namespace/{namespace}/pod/{pod}/shell/{container}` - Create a session
//! - `GET /api/v1/{cluster}/pod/{namespace}/{pod}/shell/{container}` - Same, older layout
//! - `GET /api/v1/extends/cloudShell/clusters/{cluster}` - Create a cloud-shell session
//! - `GET /api/ws` - Terminal WebSocket
//! - `GET /healthz` - Health check
//! - `GET /leader` - 200 on the active instance

#![deny(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cluster_cache;
pub mod error;
pub mod exec;
pub mod handlers;
pub mod kube_client;
pub mod metadata;
pub mod server;
pub mod session;
pub mod session_store;
pub mod terminal;

pub use audit::{AuditPublisher, HttpAuditTransport};
pub use auth::{HttpAuthorizer, JwtUserResolver};
pub use cluster_cache::{CloudShellTarget, ClusterConfigCache};
pub use error::{Error, Result};
pub use exec::ExecLauncher;
pub use kube_client::KubeClusterClient;
pub use metadata::CrdClusterSource;
pub use server::{router, start_server, AppState, ServerConfig};
pub use session::{ConnectionInfo, SessionRegistry};
pub use session_store::{run_janitor, SecretSessionStore};
pub use terminal::TerminalContext;
