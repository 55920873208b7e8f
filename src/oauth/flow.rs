//! PKCE Flow Orchestrator
//!
//! One authorization-code round trip, modelled as an explicit state machine:
//!
//! ```text
//! begin() -> AwaitingRedirect --complete(redirect)--> Completed(TokenSet)
//!                                                  \-> Failed(Error)
//! ```
//!
//! The waiting phase is a cancellable wait on a [`RedirectListener`];
//! nothing is registered globally.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::authorizer::InteractiveAuthorizer;
use super::callback::CallbackParams;
use super::metadata::AuthorizationServerMetadata;
use super::pkce::{ChallengeMethod, PkceParameters};
use super::token::{CodeExchange, TokenEndpoint, TokenSet};
use crate::config::ClientConfig;
use crate::{Error, Result};

/// What to authorize for
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Authorization server to use
    pub server: Arc<AuthorizationServerMetadata>,
    /// RFC 8707 resource indicator, when the resource metadata named one
    pub resource: Option<String>,
    /// Scopes to request
    pub scopes: BTreeSet<String>,
}

/// An authorization request that has been sent to the user and awaits
/// its redirect
#[derive(Debug)]
pub struct PendingAuthorization {
    request: AuthorizationRequest,
    pkce: PkceParameters,
    client_id: String,
    redirect_uri: String,
    authorization_url: Url,
}

impl PendingAuthorization {
    /// URL the user must visit
    pub fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    /// Issuer of the authorization server
    pub fn origin(&self) -> &str {
        &self.request.server.issuer
    }

    /// `state` sent with the authorization request
    pub fn state(&self) -> &str {
        self.pkce.state()
    }
}

/// State of one authorization attempt
#[derive(Debug)]
pub enum AuthorizationAttempt {
    /// Authorization URL presented, waiting for the redirect
    AwaitingRedirect(PendingAuthorization),
    /// Tokens issued
    Completed(TokenSet),
    /// Attempt failed; PKCE parameters are spent
    Failed(Error),
}

impl AuthorizationAttempt {
    /// Whether the attempt has reached a final state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingRedirect(_))
    }

    /// Final outcome of the attempt
    pub fn into_result(self) -> Result<TokenSet> {
        match self {
            Self::Completed(tokens) => Ok(tokens),
            Self::Failed(e) => Err(e),
            Self::AwaitingRedirect(pending) => Err(Error::AuthorizationFailed {
                origin: pending.origin().to_string(),
                error_code: "incomplete".to_string(),
                description: Some("authorization redirect never processed".to_string()),
            }),
        }
    }
}

/// Client registration request (RFC 7591)
#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: [&'a str; 1],
    grant_types: [&'static str; 2],
    response_types: [&'static str; 1],
    token_endpoint_auth_method: &'static str,
}

/// Client registration response
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

/// Drives authorization-code-with-PKCE round trips
pub struct PkceFlow {
    http: Client,
    client: ClientConfig,
    tokens: TokenEndpoint,
    authorization_timeout: Duration,
    /// Dynamically registered clients by (issuer, redirect URI)
    registered: DashMap<(String, String), String>,
}

impl PkceFlow {
    /// Create an orchestrator
    #[must_use]
    pub fn new(
        http: Client,
        client: ClientConfig,
        tokens: TokenEndpoint,
        authorization_timeout: Duration,
    ) -> Self {
        Self {
            http,
            client,
            tokens,
            authorization_timeout,
            registered: DashMap::new(),
        }
    }

    /// Run a full attempt: present the authorization URL through
    /// `authorizer`, wait for the redirect (bounded by the authorization
    /// timeout and `cancel`), then redeem the code.
    pub async fn run(
        &self,
        request: AuthorizationRequest,
        authorizer: &dyn InteractiveAuthorizer,
        cancel: &CancellationToken,
    ) -> Result<TokenSet> {
        let origin = request.server.issuer.clone();
        let listener = authorizer.listen().await?;
        let pending = self.begin(request, listener.redirect_uri()).await?;

        info!(origin = %origin, "Authorization started");
        authorizer.present(pending.authorization_url()).await?;

        let params = listener
            .wait(&origin, cancel, self.authorization_timeout)
            .await?;

        let attempt = self
            .complete(AuthorizationAttempt::AwaitingRedirect(pending), params)
            .await;
        match &attempt {
            AuthorizationAttempt::Completed(_) => info!(origin = %origin, "Authorization completed"),
            AuthorizationAttempt::Failed(e) => warn!(origin = %origin, error = %e, "Authorization failed"),
            AuthorizationAttempt::AwaitingRedirect(_) => {}
        }
        attempt.into_result()
    }

    /// Generate PKCE parameters and build the authorization URL
    pub async fn begin(
        &self,
        request: AuthorizationRequest,
        redirect_uri: &str,
    ) -> Result<PendingAuthorization> {
        let server = &request.server;
        let method = ChallengeMethod::negotiate(&server.code_challenge_methods_supported)
            .ok_or_else(|| Error::UnsupportedChallengeMethod {
                origin: server.issuer.clone(),
                offered: server.code_challenge_methods_supported.clone(),
            })?;

        let client_id = self.client_id(server, redirect_uri).await?;
        let pkce = PkceParameters::generate(method);

        let mut authorization_url =
            Url::parse(&server.authorization_endpoint).map_err(|e| Error::DiscoveryFailed {
                resource: server.issuer.clone(),
                reason: format!("invalid authorization_endpoint: {e}"),
            })?;
        {
            let mut params = authorization_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &client_id);
            params.append_pair("redirect_uri", redirect_uri);
            if !request.scopes.is_empty() {
                let scope = request
                    .scopes
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
                params.append_pair("scope", &scope);
            }
            params.append_pair("state", pkce.state());
            params.append_pair("code_challenge", pkce.code_challenge());
            params.append_pair("code_challenge_method", method.as_str());
            if let Some(resource) = &request.resource {
                params.append_pair("resource", resource);
            }
        }

        debug!(origin = %server.issuer, method = %method, "Built authorization request");
        Ok(PendingAuthorization {
            request,
            pkce,
            client_id,
            redirect_uri: redirect_uri.to_string(),
            authorization_url,
        })
    }

    /// Advance an attempt with the redirect it received.
    ///
    /// A mismatched `state` fails with [`Error::StateMismatch`] before any
    /// token request is made. Terminal attempts are returned unchanged.
    pub async fn complete(
        &self,
        attempt: AuthorizationAttempt,
        params: CallbackParams,
    ) -> AuthorizationAttempt {
        let pending = match attempt {
            AuthorizationAttempt::AwaitingRedirect(pending) => pending,
            terminal => return terminal,
        };
        let origin = pending.origin().to_string();

        let returned_state = params.state.as_deref().unwrap_or_default();
        let state_matches: bool = returned_state
            .as_bytes()
            .ct_eq(pending.pkce.state().as_bytes())
            .into();
        if !state_matches {
            warn!(origin = %origin, "Redirect state does not match the authorization request");
            return AuthorizationAttempt::Failed(Error::StateMismatch { origin });
        }

        if let Some(error_code) = params.error {
            return AuthorizationAttempt::Failed(Error::AuthorizationFailed {
                origin,
                error_code,
                description: params.error_description,
            });
        }

        let Some(code) = params.code else {
            return AuthorizationAttempt::Failed(Error::AuthorizationFailed {
                origin,
                error_code: "missing_code".to_string(),
                description: Some("redirect carried neither code nor error".to_string()),
            });
        };

        let PendingAuthorization {
            request,
            pkce,
            client_id,
            redirect_uri,
            ..
        } = pending;

        let exchange = CodeExchange {
            code: &code,
            code_verifier: pkce.into_verifier(),
            redirect_uri: &redirect_uri,
            client_id: &client_id,
            resource: request.resource.as_deref(),
            requested_scopes: &request.scopes,
        };
        match self.tokens.exchange_code(&request.server, exchange).await {
            Ok(tokens) => AuthorizationAttempt::Completed(tokens),
            Err(e) => AuthorizationAttempt::Failed(e),
        }
    }

    /// Configured client ID, or one registered dynamically for `redirect_uri`
    async fn client_id(&self, server: &AuthorizationServerMetadata, redirect_uri: &str) -> Result<String> {
        if let Some(id) = &self.client.client_id {
            return Ok(id.clone());
        }

        let key = (server.issuer.clone(), redirect_uri.to_string());
        if let Some(id) = self.registered.get(&key) {
            return Ok(id.value().clone());
        }

        let Some(endpoint) = server.registration_endpoint.as_deref() else {
            return Err(Error::Config(format!(
                "no client_id configured and {} does not support dynamic client registration",
                server.issuer
            )));
        };

        let client_id = self.register_client(&server.issuer, endpoint, redirect_uri).await?;
        self.registered.insert(key, client_id.clone());
        Ok(client_id)
    }

    /// Register a public client (RFC 7591)
    async fn register_client(&self, origin: &str, endpoint: &str, redirect_uri: &str) -> Result<String> {
        let body = RegistrationRequest {
            client_name: &self.client.client_name,
            redirect_uris: [redirect_uri],
            grant_types: ["authorization_code", "refresh_token"],
            response_types: ["code"],
            token_endpoint_auth_method: "none",
        };

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(Error::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::AuthorizationFailed {
                origin: origin.to_string(),
                error_code: "registration_failed".to_string(),
                description: Some(format!("HTTP {status}: {text}")),
            });
        }

        let registration: RegistrationResponse =
            response.json().await.map_err(|e| Error::AuthorizationFailed {
                origin: origin.to_string(),
                error_code: "registration_failed".to_string(),
                description: Some(format!("invalid registration response: {e}")),
            })?;

        info!(origin = %origin, client_id = %registration.client_id, "Registered OAuth client");
        Ok(registration.client_id)
    }
}
