//! Session registry
//!
//! A session id is the capability that binds a later terminal connection to
//! the connection metadata authorized at creation time. Anyone holding the id
//! can attach to the terminal, so ids come from the OS CSPRNG.
//!
//! Lookups hit an in-process map first. When the terminal connection lands on
//! a different instance than the one that created the session, the shared
//! store (if configured) answers instead.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long a session may wait for its terminal connection
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Number of random bytes in a session id
const SESSION_ID_BYTES: usize = 16;

/// Bearer token carried for control-pod sessions
///
/// Serialized as a plain string, never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(<redacted>)")
    }
}

/// Request context recorded for audit events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AuditContext {
    /// Client address as seen by the broker or reported by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    /// Browser user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Web user on the originating platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_user: Option<String>,
    /// Platform the request came through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Everything needed to open the terminal for a session
///
/// Created once at session creation and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Cluster the exec runs against
    pub cluster_name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name
    pub container_name: String,
    /// Authenticated user who created the session
    pub user_name: String,
    /// User the in-container script switches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_user: Option<String>,
    /// Uid the in-container script switches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_uid: Option<String>,
    /// Permission level passed to the in-container script (dev, ops, admin...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_user_auth: Option<String>,
    /// Session targets a cloud-shell backend pod on the control cluster
    #[serde(default)]
    pub is_control_cluster: bool,
    /// Cluster the cloud-shell backend should route to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cluster: Option<String>,
    /// Caller token handed to the cloud-shell backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SecretToken>,
    /// Audit request context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditContext>,
}

impl ConnectionInfo {
    /// Connection info for a regular workload pod
    pub fn workload(
        cluster_name: impl Into<String>,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
            user_name: user_name.into(),
            script_user: None,
            script_uid: None,
            script_user_auth: None,
            is_control_cluster: false,
            target_cluster: None,
            token: None,
            audit: None,
        }
    }
}

/// Opaque session identifier (32 lowercase hex characters)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from the system CSPRNG
    pub fn generate() -> Result<Self> {
        let mut raw = [0u8; SESSION_ID_BYTES];
        aws_lc_rs::rand::fill(&mut raw)
            .map_err(|_| Error::Internal("random source unavailable".into()))?;
        Ok(Self(hex::encode(raw)))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Store shared by every broker instance
///
/// Any key-value store with expiry works. Implementations must treat expired
/// entries as absent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SharedSessionStore: Send + Sync {
    /// Store a session for `ttl`
    async fn put(&self, session_id: &str, info: &ConnectionInfo, ttl: Duration) -> Result<()>;

    /// Fetch a session; `Ok(None)` if unknown or expired
    async fn get(&self, session_id: &str) -> Result<Option<ConnectionInfo>>;
}

struct LocalEntry {
    info: Arc<ConnectionInfo>,
    created_at: Instant,
}

/// Maps session ids to connection metadata
pub struct SessionRegistry {
    local: DashMap<String, LocalEntry>,
    shared: Option<Arc<dyn SharedSessionStore>>,
    ttl: Duration,
}

impl SessionRegistry {
    /// Registry backed only by this process
    pub fn local_only(ttl: Duration) -> Self {
        Self {
            local: DashMap::new(),
            shared: None,
            ttl,
        }
    }

    /// Registry that also writes through to a shared store
    pub fn with_shared_store(shared: Arc<dyn SharedSessionStore>, ttl: Duration) -> Self {
        Self {
            local: DashMap::new(),
            shared: Some(shared),
            ttl,
        }
    }

    /// Session TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store connection info under a fresh session id
    ///
    /// Only fails if no randomness is available. A shared-store write failure
    /// is logged: the session still resolves on this instance.
    pub async fn create_session(&self, info: ConnectionInfo) -> Result<SessionId> {
        let session_id = SessionId::generate()?;

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.put(session_id.as_str(), &info, self.ttl).await {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to write session to shared store, only this instance can bind it"
                );
            }
        }

        info!(
            session_id = %session_id,
            cluster = %info.cluster_name,
            namespace = %info.namespace,
            pod = %info.pod_name,
            container = %info.container_name,
            user = %info.user_name,
            "Session created"
        );

        self.purge_expired_local();
        self.local.insert(
            session_id.as_str().to_string(),
            LocalEntry {
                info: Arc::new(info),
                created_at: Instant::now(),
            },
        );

        Ok(session_id)
    }

    /// Drop local entries older than the TTL, returning how many went
    ///
    /// Runs on every session creation, so sessions that are never resolved
    /// again do not accumulate.
    pub fn purge_expired_local(&self) -> usize {
        let before = self.local.len();
        self.local
            .retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        let removed = before.saturating_sub(self.local.len());
        if removed > 0 {
            debug!(removed, "Purged expired local sessions");
        }
        removed
    }

    /// Resolve a session id, local store first
    pub async fn resolve(&self, session_id: &str) -> Option<Arc<ConnectionInfo>> {
        if let Some(info) = self.resolve_local(session_id) {
            return Some(info);
        }

        let shared = self.shared.as_ref()?;
        match shared.get(session_id).await {
            Ok(Some(info)) => {
                debug!(session_id = %session_id, "Session resolved from shared store");
                let info = Arc::new(info);
                self.local.insert(
                    session_id.to_string(),
                    LocalEntry {
                        info: info.clone(),
                        created_at: Instant::now(),
                    },
                );
                Some(info)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Shared session store lookup failed");
                None
            }
        }
    }

    fn resolve_local(&self, session_id: &str) -> Option<Arc<ConnectionInfo>> {
        let expired = {
            let entry = self.local.get(session_id)?;
            if entry.created_at.elapsed() <= self.ttl {
                return Some(entry.info.clone());
            }
            true
        };

        if expired {
            self.local.remove(session_id);
        }
        None
    }

    /// Number of sessions held in this process
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// In-process shared store, standing in for a second instance's view
    #[derive(Default)]
    struct MemorySessionStore {
        entries: DashMap<String, (ConnectionInfo, Instant)>,
    }

    #[async_trait]
    impl SharedSessionStore for MemorySessionStore {
        async fn put(&self, session_id: &str, info: &ConnectionInfo, ttl: Duration) -> Result<()> {
            self.entries
                .insert(session_id.to_string(), (info.clone(), Instant::now() + ttl));
            Ok(())
        }

        async fn get(&self, session_id: &str) -> Result<Option<ConnectionInfo>> {
            Ok(self
                .entries
                .get(session_id)
                .filter(|e| Instant::now() <= e.1)
                .map(|e| e.0.clone()))
        }
    }

    fn sample_info() -> ConnectionInfo {
        let mut info = ConnectionInfo::workload("c1", "ns", "p1", "c", "alice");
        info.script_user = Some("app".into());
        info.audit = Some(AuditContext {
            remote_ip: Some("10.1.2.3".into()),
            ..Default::default()
        });
        info
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate().unwrap();
        assert_eq!(id.as_str().len(), SESSION_ID_BYTES * 2);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let mut seen = HashSet::with_capacity(1_000_000);
        for _ in 0..1_000_000 {
            let id = SessionId::generate().unwrap();
            assert!(seen.insert(id.0), "duplicate session id generated");
        }
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let mut info = sample_info();
        info.token = Some(SecretToken::new("super-secret"));
        let debug = format!("{:?}", info);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_connection_info_serde_round_trip_keeps_token() {
        let mut info = sample_info();
        info.token = Some(SecretToken::new("tok"));
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"clusterName\":\"c1\""));
        let back: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.token.unwrap().expose(), "tok");
    }

    #[tokio::test]
    async fn test_resolve_returns_created_info() {
        let registry = SessionRegistry::local_only(DEFAULT_SESSION_TTL);
        let info = sample_info();

        let id = registry.create_session(info.clone()).await.unwrap();
        let resolved = registry.resolve(id.as_str()).await.unwrap();

        assert_eq!(*resolved, info);
    }

    #[tokio::test]
    async fn test_resolve_unknown_session() {
        let registry = SessionRegistry::local_only(DEFAULT_SESSION_TTL);
        assert!(registry.resolve("deadbeef").await.is_none());
    }

    #[tokio::test]
    async fn test_cross_instance_resolution() {
        let shared = Arc::new(MemorySessionStore::default());
        let creator = SessionRegistry::with_shared_store(shared.clone(), DEFAULT_SESSION_TTL);
        let binder = SessionRegistry::with_shared_store(shared, DEFAULT_SESSION_TTL);

        let id = creator.create_session(sample_info()).await.unwrap();
        assert_eq!(binder.local_len(), 0);

        let resolved = binder.resolve(id.as_str()).await.unwrap();
        assert_eq!(*resolved, sample_info());
        // Cached locally after the first shared hit
        assert_eq!(binder.local_len(), 1);
    }

    #[tokio::test]
    async fn test_shared_store_failure_resolves_as_not_found() {
        let mut shared = MockSharedSessionStore::new();
        shared
            .expect_get()
            .times(1)
            .returning(|_| Err(Error::Internal("connection refused".into())));

        let registry = SessionRegistry::with_shared_store(Arc::new(shared), DEFAULT_SESSION_TTL);
        assert!(registry.resolve("0123").await.is_none());
    }

    #[tokio::test]
    async fn test_shared_store_write_failure_still_creates_session() {
        let mut shared = MockSharedSessionStore::new();
        shared
            .expect_put()
            .times(1)
            .returning(|_, _, _| Err(Error::Internal("unavailable".into())));

        let registry = SessionRegistry::with_shared_store(Arc::new(shared), DEFAULT_SESSION_TTL);
        let id = registry.create_session(sample_info()).await.unwrap();
        assert!(registry.resolve(id.as_str()).await.is_some());
    }

    #[tokio::test]
    async fn test_local_entries_expire_with_ttl() {
        let registry = SessionRegistry::local_only(Duration::ZERO);
        let id = registry.create_session(sample_info()).await.unwrap();

        std::thread::sleep(Duration::from_millis(2));
        assert!(registry.resolve(id.as_str()).await.is_none());
        assert_eq!(registry.local_len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_sessions_are_purged_on_create() {
        let registry = SessionRegistry::local_only(Duration::ZERO);
        for _ in 0..1001 {
            registry.create_session(sample_info()).await.unwrap();
        }

        std::thread::sleep(Duration::from_millis(2));
        let latest = registry.create_session(sample_info()).await.unwrap();
        assert_eq!(registry.local_len(), 1);
        assert!(registry.local.contains_key(latest.as_str()));
    }

    #[tokio::test]
    async fn test_live_sessions_survive_purge() {
        let registry = SessionRegistry::local_only(DEFAULT_SESSION_TTL);
        let first = registry.create_session(sample_info()).await.unwrap();
        registry.create_session(sample_info()).await.unwrap();

        assert_eq!(registry.purge_expired_local(), 0);
        assert_eq!(registry.local_len(), 2);
        assert!(registry.resolve(first.as_str()).await.is_some());
    }

    #[tokio::test]
    async fn test_shared_entries_expire_with_ttl() {
        let shared = Arc::new(MemorySessionStore::default());
        let creator = SessionRegistry::with_shared_store(shared.clone(), Duration::ZERO);
        let binder = SessionRegistry::with_shared_store(shared, DEFAULT_SESSION_TTL);

        let id = creator.create_session(sample_info()).await.unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(binder.resolve(id.as_str()).await.is_none());
    }
}
