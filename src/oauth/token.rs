//! Token sets and token endpoint requests
//!
//! Authorization-code exchange (with PKCE verifier), refresh, and RFC 7009
//! revocation against an authorization server's endpoints.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metadata::AuthorizationServerMetadata;
use crate::{Error, Result};

/// Credential material for one authorization server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer access token
    pub access_token: String,

    /// Refresh token, if the server issued one
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Absolute expiry, fixed when the token response was received
    pub expires_at: DateTime<Utc>,

    /// Scopes the server granted
    #[serde(default)]
    pub granted_scopes: BTreeSet<String>,

    /// Issuer identity of the authorization server
    pub origin: String,

    /// Client the tokens were issued to (needed for refresh and revocation)
    pub client_id: String,
}

impl TokenSet {
    /// Whether the access token expires within `margin` of now
    pub fn expires_within(&self, margin: TimeDelta) -> bool {
        Utc::now() + margin >= self.expires_at
    }

    /// Whether the access token has already expired
    pub fn is_expired(&self) -> bool {
        self.expires_within(TimeDelta::zero())
    }

    /// Time until expiration, `None` once expired
    pub fn time_until_expiry(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }

    /// Whether every scope in `scopes` was granted
    pub fn covers<'a>(&self, scopes: impl IntoIterator<Item = &'a String>) -> bool {
        scopes.into_iter().all(|s| self.granted_scopes.contains(s))
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("granted_scopes", &self.granted_scopes)
            .field("origin", &self.origin)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// OAuth error response body (RFC 6749 section 5.2)
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Grant being redeemed, decides how failures are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Client for an authorization server's token and revocation endpoints
#[derive(Clone)]
pub struct TokenEndpoint {
    http: Client,
    default_lifetime: Duration,
}

/// Inputs for redeeming an authorization code
pub struct CodeExchange<'a> {
    /// Authorization code from the redirect
    pub code: &'a str,
    /// PKCE verifier matching the challenge sent earlier
    pub code_verifier: String,
    /// Redirect URI used in the authorization request
    pub redirect_uri: &'a str,
    /// Client ID used in the authorization request
    pub client_id: &'a str,
    /// RFC 8707 resource indicator
    pub resource: Option<&'a str>,
    /// Scopes requested, assumed granted when the response omits `scope`
    pub requested_scopes: &'a BTreeSet<String>,
}

impl TokenEndpoint {
    /// Create a token endpoint client; `default_lifetime` applies when a
    /// response omits `expires_in`
    #[must_use]
    pub fn new(http: Client, default_lifetime: Duration) -> Self {
        Self {
            http,
            default_lifetime,
        }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        server: &AuthorizationServerMetadata,
        exchange: CodeExchange<'_>,
    ) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", exchange.code),
            ("redirect_uri", exchange.redirect_uri),
            ("client_id", exchange.client_id),
            ("code_verifier", exchange.code_verifier.as_str()),
        ];
        if let Some(resource) = exchange.resource {
            params.push(("resource", resource));
        }

        let (received_at, response) = self
            .post_token(server, &params, Grant::AuthorizationCode)
            .await?;

        Ok(self.build_token_set(
            response,
            received_at,
            &server.issuer,
            exchange.client_id,
            exchange.requested_scopes,
            None,
        ))
    }

    /// Redeem `current.refresh_token` for a new token set.
    ///
    /// Keeps the previous refresh token and scopes when the response omits them.
    pub async fn refresh(
        &self,
        server: &AuthorizationServerMetadata,
        current: &TokenSet,
        resource: Option<&str>,
    ) -> Result<TokenSet> {
        let Some(refresh_token) = current.refresh_token.as_deref() else {
            return Err(Error::ReauthorizationRequired {
                origin: server.issuer.clone(),
                reason: "no refresh token".to_string(),
            });
        };

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", current.client_id.as_str()),
        ];
        if let Some(resource) = resource {
            params.push(("resource", resource));
        }

        let (received_at, response) = self
            .post_token(server, &params, Grant::RefreshToken)
            .await?;

        Ok(self.build_token_set(
            response,
            received_at,
            &server.issuer,
            &current.client_id,
            &current.granted_scopes,
            Some(current),
        ))
    }

    /// Revoke a token set at the server's revocation endpoint (RFC 7009).
    ///
    /// Revokes the refresh token when present, which also invalidates the
    /// access tokens derived from it.
    pub async fn revoke(&self, server: &AuthorizationServerMetadata, tokens: &TokenSet) -> Result<()> {
        let Some(endpoint) = server.revocation_endpoint.as_deref() else {
            return Ok(());
        };

        let (token, hint) = match tokens.refresh_token.as_deref() {
            Some(refresh) => (refresh, "refresh_token"),
            None => (tokens.access_token.as_str(), "access_token"),
        };
        let params = [
            ("token", token),
            ("token_type_hint", hint),
            ("client_id", tokens.client_id.as_str()),
        ];

        let response = self
            .http
            .post(endpoint)
            .form(&params)
            .send()
            .await
            .map_err(Error::from)?;

        let status = response.status();
        if status.is_success() {
            debug!(origin = %server.issuer, "Token revoked");
            Ok(())
        } else {
            Err(Error::NetworkError {
                message: format!("revocation endpoint returned HTTP {status}"),
                status: Some(status.as_u16()),
            })
        }
    }

    async fn post_token(
        &self,
        server: &AuthorizationServerMetadata,
        params: &[(&str, &str)],
        grant: Grant,
    ) -> Result<(DateTime<Utc>, TokenResponse)> {
        let response = self
            .http
            .post(&server.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(Error::from)?;
        // expiry is measured from the moment the response arrived
        let received_at = Utc::now();

        let status = response.status();
        let body = response.bytes().await.map_err(Error::from)?;

        if !status.is_success() {
            return Err(token_error(&server.issuer, status, &body, grant));
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| Error::TokenExchangeFailed {
                origin: server.issuer.clone(),
                status: Some(status.as_u16()),
                error_code: "invalid_token_response".to_string(),
                description: Some(e.to_string()),
            })?;

        if let Some(token_type) = parsed.token_type.as_deref() {
            if !token_type.eq_ignore_ascii_case("bearer") {
                return Err(Error::TokenExchangeFailed {
                    origin: server.issuer.clone(),
                    status: Some(status.as_u16()),
                    error_code: "unsupported_token_type".to_string(),
                    description: Some(format!("token_type {token_type} is not Bearer")),
                });
            }
        }

        Ok((received_at, parsed))
    }

    fn build_token_set(
        &self,
        response: TokenResponse,
        received_at: DateTime<Utc>,
        origin: &str,
        client_id: &str,
        fallback_scopes: &BTreeSet<String>,
        previous: Option<&TokenSet>,
    ) -> TokenSet {
        let lifetime = response
            .expires_in
            .map_or(self.default_lifetime, Duration::from_secs);
        // clamp absurd lifetimes instead of overflowing
        let lifetime = TimeDelta::from_std(lifetime)
            .unwrap_or(TimeDelta::MAX)
            .min(TimeDelta::days(3650));

        let granted_scopes = response.scope.as_deref().map_or_else(
            || fallback_scopes.clone(),
            |s| s.split_whitespace().map(String::from).collect(),
        );

        let refresh_token = response
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        TokenSet {
            access_token: response.access_token,
            refresh_token,
            expires_at: received_at + lifetime,
            granted_scopes,
            origin: origin.to_string(),
            client_id: client_id.to_string(),
        }
    }
}

/// Map a failed token endpoint response.
///
/// Code exchange failures keep the server's error code verbatim. A refresh
/// rejected by the server (4xx) means the refresh token is dead; 5xx and 429
/// are transient and leave stored credentials alone.
fn token_error(origin: &str, status: StatusCode, body: &[u8], grant: Grant) -> Error {
    let parsed: ErrorResponse = serde_json::from_slice(body).unwrap_or_default();
    let error_code = parsed
        .error
        .unwrap_or_else(|| format!("http_{}", status.as_u16()));

    match grant {
        Grant::RefreshToken if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            Error::NetworkError {
                message: format!("token endpoint returned HTTP {status} during refresh"),
                status: Some(status.as_u16()),
            }
        }
        Grant::RefreshToken => Error::ReauthorizationRequired {
            origin: origin.to_string(),
            reason: match parsed.error_description {
                Some(d) => format!("refresh rejected: {error_code} - {d}"),
                None => format!("refresh rejected: {error_code}"),
            },
        },
        Grant::AuthorizationCode => Error::TokenExchangeFailed {
            origin: origin.to_string(),
            status: Some(status.as_u16()),
            error_code,
            description: parsed.error_description,
        },
    }
}
