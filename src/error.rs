//! Error types for MCP Gateway Auth

use std::time::Duration;

use thiserror::Error;

/// Result type alias for MCP Gateway Auth
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication and transport errors.
///
/// `Clone` so that one single-flight outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Resource or authorization server metadata could not be discovered
    #[error("Discovery failed for {resource}: {reason}")]
    DiscoveryFailed {
        /// Resource (or metadata URL) being resolved
        resource: String,
        /// What went wrong
        reason: String,
    },

    /// No PKCE challenge method offered by the server is supported
    #[error("Authorization server {origin} offers no supported PKCE method (offered: {offered:?})")]
    UnsupportedChallengeMethod {
        /// Authorization server issuer
        origin: String,
        /// Methods the server advertised
        offered: Vec<String>,
    },

    /// Redirect `state` did not match the one sent with the authorization request
    #[error("State mismatch on authorization redirect from {origin} - possible CSRF attempt")]
    StateMismatch {
        /// Authorization server issuer
        origin: String,
    },

    /// Token endpoint rejected the request
    #[error("Token exchange with {origin} failed: {error_code}{}", fmt_description(.description))]
    TokenExchangeFailed {
        /// Authorization server issuer
        origin: String,
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Server-provided error code, verbatim
        error_code: String,
        /// Server-provided description
        description: Option<String>,
    },

    /// Stored credentials can no longer be refreshed; a new authorization is needed
    #[error("Re-authorization required for {origin}: {reason}")]
    ReauthorizationRequired {
        /// Authorization server issuer
        origin: String,
        /// Why refresh was impossible
        reason: String,
    },

    /// Request still rejected with 401 after refreshing credentials
    #[error("Unauthenticated: {url} returned HTTP {status} after re-authentication")]
    Unauthenticated {
        /// Authorization server issuer, if known
        origin: Option<String>,
        /// Request URL
        url: String,
        /// HTTP status
        status: u16,
    },

    /// Organization or administrator policy blocks access
    #[error("Blocked by organization policy ({error_code}): {message}")]
    OrgPolicyBlocked {
        /// Authorization server issuer, if known
        origin: Option<String>,
        /// HTTP status
        status: u16,
        /// Server-provided error code
        error_code: String,
        /// Server-provided message
        message: String,
        /// Where an administrator can approve access, if the server said
        approval_url: Option<String>,
    },

    /// Credential lacks the scope the resource requires
    #[error("Insufficient scope: requires {}", .required_scopes.join(" "))]
    InsufficientScope {
        /// Authorization server issuer, if known
        origin: Option<String>,
        /// HTTP status
        status: u16,
        /// Scopes the resource asked for
        required_scopes: Vec<String>,
    },

    /// Generic 403, surfaced as-is
    #[error("Forbidden (HTTP {status}): {message}")]
    Forbidden {
        /// HTTP status
        status: u16,
        /// Server-provided error code
        error_code: Option<String>,
        /// Server-provided message
        message: String,
    },

    /// Still rate limited after bounded retries
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        /// Attempts made
        attempts: u32,
        /// Last `Retry-After` the server sent
        retry_after: Option<Duration>,
    },

    /// Network failure, timeout, or transient server error
    #[error("Network error: {message}")]
    NetworkError {
        /// What went wrong
        message: String,
        /// HTTP status for transient server errors
        status: Option<u16>,
    },

    /// Interactive authorization did not produce a code
    #[error("Authorization with {origin} failed: {error_code}{}", fmt_description(.description))]
    AuthorizationFailed {
        /// Authorization server issuer
        origin: String,
        /// `error` from the redirect, or a local reason code
        error_code: String,
        /// Human-readable detail
        description: Option<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential store error
    #[error("Credential store error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_description(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" - {d}"))
        .unwrap_or_default()
}

impl Error {
    /// Create a network error without a status
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
            status: None,
        }
    }

    /// Whether the failure is transient and may be retried locally
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::RateLimited { .. })
    }

    /// Actionable guidance for conditions a human has to resolve
    #[must_use]
    pub fn guidance(&self) -> Option<String> {
        match self {
            Self::OrgPolicyBlocked { approval_url, .. } => Some(match approval_url {
                Some(url) => format!(
                    "An organization administrator must approve this application. Request approval at {url}"
                ),
                None => "An organization administrator must approve this application \
                         (check the organization's third-party application policy)"
                    .to_string(),
            }),
            Self::InsufficientScope { required_scopes, .. } => Some(format!(
                "Re-authorize and grant the scope(s): {}",
                required_scopes.join(" ")
            )),
            Self::ReauthorizationRequired { .. } => {
                Some("Sign in again to obtain new credentials".to_string())
            }
            _ => None,
        }
    }

    /// HTTP status associated with the failure, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthenticated { status, .. }
            | Self::OrgPolicyBlocked { status, .. }
            | Self::InsufficientScope { status, .. }
            | Self::Forbidden { status, .. } => Some(*status),
            Self::TokenExchangeFailed { status, .. } | Self::NetworkError { status, .. } => *status,
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::network(format!("request timed out: {e}"))
        } else {
            Self::NetworkError {
                message: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}
