//! PKCE parameters (RFC 7636)
//!
//! A fresh [`PkceParameters`] is generated for every authorization attempt
//! and consumed by the token exchange, so it cannot be replayed.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// PKCE code challenge method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`
    S256,
    /// Challenge equals the verifier; only used when S256 is not offered
    Plain,
}

impl ChallengeMethod {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }

    /// Strongest method among those the server offers
    pub fn negotiate(offered: &[String]) -> Option<Self> {
        [Self::S256, Self::Plain]
            .into_iter()
            .find(|m| offered.iter().any(|o| o == m.as_str()))
    }

    /// Derive the code challenge for a verifier
    #[must_use]
    pub fn challenge_for(self, verifier: &str) -> String {
        match self {
            Self::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
            Self::Plain => verifier.to_string(),
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verifier, challenge and anti-CSRF state for one authorization attempt
pub struct PkceParameters {
    code_verifier: String,
    code_challenge: String,
    method: ChallengeMethod,
    state: String,
}

impl PkceParameters {
    /// Generate fresh parameters for `method`
    #[must_use]
    pub fn generate(method: ChallengeMethod) -> Self {
        // 32 bytes -> 43 base64url chars, the RFC 7636 minimum length
        let verifier_bytes: [u8; 32] = rand::random();
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = method.challenge_for(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
            method,
            state: generate_state(),
        }
    }

    /// Code challenge sent with the authorization request
    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    /// Challenge method sent with the authorization request
    pub fn method(&self) -> ChallengeMethod {
        self.method
    }

    /// Anti-CSRF state sent with the authorization request
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Give up the verifier for the token request; the parameters are spent
    #[must_use]
    pub fn into_verifier(self) -> String {
        self.code_verifier
    }
}

impl fmt::Debug for PkceParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceParameters")
            .field("code_verifier", &"<redacted>")
            .field("code_challenge", &self.code_challenge)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish()
    }
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
