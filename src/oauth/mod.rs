//! OAuth 2.1 client for MCP gateways
//!
//! Implements the authorization code flow with PKCE (RFC 7636) against
//! the authorization server protecting a gateway.
//!
//! Features:
//! - Protected resource (RFC 9728) and authorization server (RFC 8414) discovery
//! - Authorization code flow with PKCE and resource indicators (RFC 8707)
//! - Dynamic client registration (RFC 7591)
//! - Token storage, single-flight refresh and revocation (RFC 7009)
//! - Browser-based authorization with a loopback redirect receiver

pub mod authorizer;
pub mod callback;
pub mod challenge;
pub mod flow;
pub mod lifecycle;
pub mod metadata;
pub mod pkce;
pub mod storage;
pub mod token;

pub use authorizer::{BrowserAuthorizer, InteractiveAuthorizer};
pub use callback::{CallbackParams, RedirectListener};
pub use challenge::{Challenge, bearer_challenge, parse_challenges};
pub use flow::{AuthorizationAttempt, AuthorizationRequest, PendingAuthorization, PkceFlow};
pub use lifecycle::{OriginRegistration, TokenManager};
pub use metadata::{
    AuthorizationServerMetadata, Discovery, MetadataResolver, ResourceMetadata, base_url,
};
pub use pkce::{ChallengeMethod, PkceParameters};
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use token::{TokenEndpoint, TokenSet};
