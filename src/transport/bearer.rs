//! Bearer Transport
//!
//! Wraps outbound calls to the gateway: attaches the current access token,
//! recovers from 401 once (refresh or re-authorization, then one retry),
//! hands 403 to the classifier and backs off on 429 and 5xx.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use super::Transport;
use crate::classify::{Classification, classify, quota_exhausted, retry_after};
use crate::config::Config;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::oauth::{
    CredentialStore, InteractiveAuthorizer, MetadataResolver, OriginRegistration, TokenManager,
    TokenSet, base_url,
};
use crate::{Error, Result};

/// Injects bearer credentials into gateway requests
pub struct BearerTransport {
    http: Client,
    manager: TokenManager,
    resolver: Arc<MetadataResolver>,
    retry: RetryPolicy,
    /// Resource base URL -> authorization server origin
    bindings: DashMap<String, String>,
}

impl BearerTransport {
    /// Create a transport from its parts
    #[must_use]
    pub fn new(
        http: Client,
        manager: TokenManager,
        resolver: Arc<MetadataResolver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            manager,
            resolver,
            retry,
            bindings: DashMap::new(),
        }
    }

    /// Build the whole stack (HTTP client, resolver, token manager) from config
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        authorizer: Arc<dyn InteractiveAuthorizer>,
    ) -> Result<Self> {
        let http = super::http_client(config)?;
        let retry = RetryPolicy::new(&config.retry);
        let resolver = Arc::new(MetadataResolver::new(http.clone(), retry.clone()));
        let manager = TokenManager::new(config, http.clone(), store, authorizer);
        Ok(Self::new(http, manager, resolver, retry))
    }

    /// Token manager shared with this transport
    pub fn manager(&self) -> &TokenManager {
        &self.manager
    }

    /// Start a request with the underlying client
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Build and send a request
    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder
            .build()
            .map_err(|e| Error::Internal(format!("Invalid request: {e}")))?;
        self.send(request).await
    }

    /// Associate requests to `resource` with an already known authorization
    /// server, so the first request carries credentials
    pub fn bind(&self, resource: &Url, registration: OriginRegistration) -> String {
        let origin = self.manager.register(registration);
        self.bindings.insert(base_url(resource), origin.clone());
        origin
    }

    /// Authorization server origin bound to `resource`, if discovered
    pub fn origin_for(&self, resource: &Url) -> Option<String> {
        self.bindings
            .get(&base_url(resource))
            .map(|entry| entry.value().clone())
    }

    /// Send `request` with credentials, recovering from expiry and scope
    /// gaps where possible.
    ///
    /// The request body must be replayable (not a stream).
    pub async fn send(&self, request: Request) -> Result<Response> {
        let url = request.url().clone();
        let mut origin = self.origin_for(&url);
        let mut tokens = match &origin {
            Some(origin) => Some(self.manager.current(origin).await?),
            None => None,
        };
        let mut reauthenticated = false;
        let mut scope_upgraded = false;

        loop {
            let response = self.dispatch(&request, tokens.as_ref()).await?;
            let status = response.status();

            match status {
                StatusCode::UNAUTHORIZED => {
                    if reauthenticated {
                        warn!(url = %url, "Still unauthorized after re-authentication");
                        return Err(Error::Unauthenticated {
                            origin,
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    reauthenticated = true;

                    let known = match origin.clone() {
                        Some(known) => known,
                        None => {
                            let discovered = self.discover(&url, &response).await?;
                            origin = Some(discovered.clone());
                            discovered
                        }
                    };
                    tokens = Some(match &tokens {
                        Some(rejected) => {
                            debug!(origin = %known, "Access token rejected, renewing");
                            self.manager.recover(&known, &rejected.access_token).await?
                        }
                        None => self.manager.current(&known).await?,
                    });
                }
                StatusCode::FORBIDDEN => {
                    let headers = response.headers().clone();
                    let body = response.bytes().await.map_err(Error::from)?;

                    match classify(status, &headers, &body) {
                        Classification::InsufficientScope { required_scopes }
                            if !scope_upgraded && origin.is_some() =>
                        {
                            scope_upgraded = true;
                            let known = origin.as_deref().unwrap_or_default();
                            info!(origin = %known, scopes = ?required_scopes, "Re-authorizing for additional scopes");
                            tokens = Some(self.manager.authorize(known, &required_scopes).await?);
                        }
                        classification => {
                            let err = classification
                                .into_error(origin.as_deref(), url.as_str(), status.as_u16(), 1)
                                .unwrap_or_else(|| Error::Forbidden {
                                    status: status.as_u16(),
                                    error_code: None,
                                    message: "Forbidden".to_string(),
                                });
                            debug!(url = %url, error = %err, "Request forbidden");
                            return Err(err);
                        }
                    }
                }
                _ => return Ok(response),
            }
        }
    }

    /// Resolve discovery from a 401 and bind the resource to its server
    async fn discover(&self, url: &Url, response: &Response) -> Result<String> {
        let discovery = self
            .resolver
            .resolve_challenge(url, response.headers())
            .await?;
        let origin = self.bind(url, OriginRegistration::from(&discovery));
        info!(resource = %discovery.resource.resource, origin = %origin, "Discovered authorization server");
        Ok(origin)
    }

    /// Send one logical attempt, backing off on 429, quota-exhausted 403, 5xx
    /// and network errors
    async fn dispatch(&self, request: &Request, tokens: Option<&TokenSet>) -> Result<Response> {
        let mut attempt = 0u32;
        with_retry(&self.retry, "gateway_request", || {
            attempt += 1;
            let number = attempt;
            let prepared = prepare(request, tokens);
            async move {
                let response = self.http.execute(prepared?).await.map_err(Error::from)?;
                let status = response.status();
                let throttled = status == StatusCode::TOO_MANY_REQUESTS
                    || (status == StatusCode::FORBIDDEN && quota_exhausted(response.headers()));
                if throttled {
                    return Err(Error::RateLimited {
                        attempts: number,
                        retry_after: retry_after(response.headers()),
                    });
                }
                if status.is_server_error() {
                    return Err(Error::NetworkError {
                        message: format!("{} returned HTTP {status}", response.url()),
                        status: Some(status.as_u16()),
                    });
                }
                Ok(response)
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl Transport for BearerTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        BearerTransport::send(self, request).await
    }
}

/// Copy of `request` carrying the bearer token; other headers untouched
fn prepare(request: &Request, tokens: Option<&TokenSet>) -> Result<Request> {
    let mut prepared = request
        .try_clone()
        .ok_or_else(|| Error::Internal("request body cannot be replayed".to_string()))?;

    if let Some(tokens) = tokens {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", tokens.access_token))
            .map_err(|_| Error::Internal("access token is not a valid header value".to_string()))?;
        value.set_sensitive(true);
        prepared.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(prepared)
}
