//! OAuth Metadata Discovery
//!
//! Implements RFC 9728 (OAuth Protected Resource Metadata) and
//! RFC 8414 (OAuth Authorization Server Metadata), starting from the
//! `resource_metadata` URL a gateway names in its 401 challenge.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::challenge::bearer_challenge;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Token revocation endpoint (RFC 7009)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Dynamic client registration endpoint (RFC 7591)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource, in
    /// order of preference
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// A consistent resource / authorization server pair
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Metadata of the protected resource
    pub resource: Arc<ResourceMetadata>,
    /// Metadata of the selected authorization server
    pub server: Arc<AuthorizationServerMetadata>,
}

impl Discovery {
    /// Issuer identity of the selected authorization server
    pub fn origin(&self) -> &str {
        &self.server.issuer
    }
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

/// Resolves and caches discovery documents.
///
/// Resource metadata is cached by metadata URL; authorization server
/// metadata is cached by issuer for the lifetime of the resolver.
pub struct MetadataResolver {
    http: Client,
    retry: RetryPolicy,
    resources: DashMap<String, Arc<ResourceMetadata>>,
    servers: DashMap<String, Arc<AuthorizationServerMetadata>>,
}

impl MetadataResolver {
    /// Create a resolver using `http` (which carries the request timeout)
    #[must_use]
    pub fn new(http: Client, retry: RetryPolicy) -> Self {
        Self {
            http,
            retry,
            resources: DashMap::new(),
            servers: DashMap::new(),
        }
    }

    /// Resolve from a 401 response to `request_url`.
    ///
    /// Uses the Bearer challenge's `resource_metadata` URL, falling back to
    /// the well-known location on the request's origin.
    pub async fn resolve_challenge(&self, request_url: &Url, headers: &HeaderMap) -> Result<Discovery> {
        let metadata_url = match bearer_challenge(headers)
            .as_ref()
            .and_then(|c| c.resource_metadata())
        {
            Some(url) => url.to_string(),
            None => {
                debug!(url = %request_url, "No resource_metadata in challenge, using well-known location");
                format!(
                    "{}/.well-known/oauth-protected-resource",
                    base_url(request_url)
                )
            }
        };
        self.resolve(&metadata_url).await
    }

    /// Resolve the resource metadata at `metadata_url` and the first
    /// authorization server whose metadata can be fetched.
    pub async fn resolve(&self, metadata_url: &str) -> Result<Discovery> {
        let resource = self.resource_metadata(metadata_url).await?;

        if resource.authorization_servers.is_empty() {
            return Err(Error::DiscoveryFailed {
                resource: resource.resource.clone(),
                reason: "resource metadata lists no authorization servers".to_string(),
            });
        }

        let mut failures = Vec::new();
        for issuer in &resource.authorization_servers {
            match self.authorization_server(issuer).await {
                Ok(server) => {
                    debug!(resource = %resource.resource, issuer = %server.issuer, "Selected authorization server");
                    return Ok(Discovery { resource, server });
                }
                Err(e) => {
                    warn!(issuer = %issuer, error = %e, "Authorization server unusable, trying next");
                    failures.push(format!("{issuer}: {e}"));
                }
            }
        }

        Err(Error::DiscoveryFailed {
            resource: resource.resource.clone(),
            reason: format!("no usable authorization server ({})", failures.join("; ")),
        })
    }

    /// Fetch (or return cached) resource metadata
    pub async fn resource_metadata(&self, metadata_url: &str) -> Result<Arc<ResourceMetadata>> {
        if let Some(cached) = self.resources.get(metadata_url) {
            return Ok(Arc::clone(cached.value()));
        }

        debug!(url = %metadata_url, "Discovering protected resource metadata");
        let metadata: ResourceMetadata = with_retry(&self.retry, "resource_metadata", || {
            fetch_json(&self.http, metadata_url)
        })
        .await?;

        let metadata = Arc::new(metadata);
        self.resources
            .insert(metadata_url.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }

    /// Fetch (or return cached) metadata for `issuer`
    pub async fn authorization_server(&self, issuer: &str) -> Result<Arc<AuthorizationServerMetadata>> {
        let key = issuer.trim_end_matches('/');
        if let Some(cached) = self.servers.get(key) {
            return Ok(Arc::clone(cached.value()));
        }

        let url = format!("{key}/.well-known/oauth-authorization-server");
        debug!(url = %url, "Discovering OAuth authorization server metadata");

        let metadata: AuthorizationServerMetadata =
            with_retry(&self.retry, "authorization_server_metadata", || {
                fetch_json(&self.http, &url)
            })
            .await?;

        if metadata.issuer.trim_end_matches('/') != key {
            return Err(Error::DiscoveryFailed {
                resource: url,
                reason: format!(
                    "issuer mismatch: expected {key}, document says {}",
                    metadata.issuer
                ),
            });
        }

        let metadata = Arc::new(metadata);
        self.servers.insert(key.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }
}

/// GET a discovery document. 5xx and transport failures are `NetworkError`
/// (retryable); anything else is `DiscoveryFailed`.
async fn fetch_json<T: DeserializeOwned>(http: &Client, url: &str) -> Result<T> {
    let response = http.get(url).send().await.map_err(Error::from)?;

    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::NetworkError {
            message: format!("{url} returned HTTP {status}"),
            status: Some(status.as_u16()),
        });
    }
    if !status.is_success() {
        return Err(Error::DiscoveryFailed {
            resource: url.to_string(),
            reason: format!("HTTP {status}"),
        });
    }

    let body = response.bytes().await.map_err(Error::from)?;
    serde_json::from_slice(&body).map_err(|e| Error::DiscoveryFailed {
        resource: url.to_string(),
        reason: format!("invalid metadata document: {e}"),
    })
}

/// Extract the base URL (scheme + host + port) from a full URL
pub fn base_url(url: &Url) -> String {
    url.origin().ascii_serialization()
}
