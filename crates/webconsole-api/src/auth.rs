//! Caller authentication and authorization
//!
//! The acting user comes from an HS256 JWT carried as `Bearer <token>` in the
//! `Authorization` header, or in a cookie of the same name. Whether that user
//! may open a shell in a namespace is decided by the platform's authorization
//! service.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Cookie that may carry the bearer token
const AUTH_COOKIE: &str = "Authorization";
/// Timeout for authorization service calls
const AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(5);
/// Authorization service path
const AUTHORIZE_PATH: &str = "/api/v1/cube/authorization/access";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    /// Username from the token
    pub username: String,
    /// Raw bearer token
    pub token: String,
}

/// Pull the bearer token out of the request
///
/// The header wins over the cookie. The scheme is matched case-insensitively.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| cookie_value(headers, AUTH_COOKIE))?;

    strip_bearer(&raw).map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
}

fn strip_bearer(raw: &str) -> Option<&str> {
    let scheme = raw.get(..6)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    // Cookies carry the separator as a space, '+', or percent-encoded
    let rest = &raw[6..];
    let token = rest
        .strip_prefix("%20")
        .or_else(|| rest.strip_prefix(' '))
        .or_else(|| rest.strip_prefix('+'))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// Resolves the acting user of a request
#[cfg_attr(test, mockall::automock)]
pub trait UserResolver: Send + Sync {
    /// `None` when the request carries no valid identity
    fn resolve(&self, headers: &HeaderMap) -> Option<ResolvedUser>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UserInfo {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "UserInfo")]
    user_info: UserInfo,
}

/// Validates platform-issued HS256 tokens
pub struct JwtUserResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtUserResolver {
    /// Create a resolver for tokens signed with `secret`
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Platform tokens do not always carry exp; it is still checked when present
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Username in `token`, if the token is valid
    pub fn username(&self, token: &str) -> Option<String> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => {
                let username = data.claims.user_info.username;
                (!username.is_empty()).then_some(username)
            }
            Err(e) => {
                debug!(error = %e, "Rejected token");
                None
            }
        }
    }
}

impl UserResolver for JwtUserResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<ResolvedUser> {
        let token = extract_token(headers)?;
        let username = self.username(&token)?;
        Some(ResolvedUser { username, token })
    }
}

/// Decides whether a user may open shells in a namespace
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(true)` to allow
    async fn authorize(&self, user: &str, namespace: &str, cluster: &str) -> Result<bool>;
}

/// Resource attributes sent to the authorization service
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessAttributes {
    /// Acting user
    pub user: String,
    /// Always `get`
    pub verb: String,
    /// Target namespace
    pub namespace: String,
    /// Empty for core resources
    pub api_group: String,
    /// Empty for the preferred version
    pub api_version: String,
    /// Always `pods`
    pub resource: String,
    /// Unused
    pub subresource: String,
    /// Unused
    pub name: String,
    /// Always true
    pub resource_request: bool,
    /// Unused
    pub path: String,
}

impl AccessAttributes {
    /// Attributes for reading pods in `namespace`
    pub fn pod_access(user: &str, namespace: &str) -> Self {
        Self {
            user: user.to_string(),
            verb: "get".to_string(),
            namespace: namespace.to_string(),
            api_group: String::new(),
            api_version: String::new(),
            resource: "pods".to_string(),
            subresource: String::new(),
            name: String::new(),
            resource_request: true,
            path: String::new(),
        }
    }
}

/// Asks the platform authorization service over HTTPS
pub struct HttpAuthorizer {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthorizer {
    /// Create an authorizer for the service at `host` (`name:port`)
    ///
    /// The service presents an in-cluster certificate, so verification is off.
    pub fn new(host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(AUTHORIZE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build authorization client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("https://{}{}", host, AUTHORIZE_PATH),
        })
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, user: &str, namespace: &str, cluster: &str) -> Result<bool> {
        let attributes = AccessAttributes::pod_access(user, namespace);
        let response = self
            .client
            .post(&self.url)
            .json(&attributes)
            .send()
            .await
            .map_err(|e| {
                warn!(user = %user, cluster = %cluster, error = %e, "Authorization request failed");
                Error::PermissionDenied("authorization service unavailable".to_string())
            })?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::PermissionDenied(format!("unreadable authorization reply: {}", e)))?;

        let allowed = body.trim() == "true";
        debug!(user = %user, namespace = %namespace, cluster = %cluster, allowed, "Authorization decided");
        Ok(allowed)
    }
}
