//! MCP Gateway Auth Library
//!
//! OAuth 2.1 + PKCE authentication and bearer-credential transport for
//! clients of a remote MCP gateway.
//!
//! # Features
//!
//! - **Discovery**: resource and authorization server metadata from 401 challenges
//! - **PKCE Flow**: authorization code exchange with S256, loopback redirect receiver
//! - **Token Lifecycle**: cached credentials, single-flight refresh, revocation
//! - **Bearer Transport**: token injection, 401 recovery, 403 classification, 429 backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mcp_gateway_auth::config::Config;
//! use mcp_gateway_auth::oauth::{BrowserAuthorizer, FileCredentialStore};
//! use mcp_gateway_auth::transport::BearerTransport;
//!
//! # async fn example() -> mcp_gateway_auth::Result<()> {
//! let config = Config::load(None)?;
//! let store = Arc::new(FileCredentialStore::from_config(&config)?);
//! let authorizer = Arc::new(BrowserAuthorizer::new(&config.client));
//! let transport = BearerTransport::from_config(&config, store, authorizer)?;
//!
//! let response = transport
//!     .execute(transport.request(reqwest::Method::POST, "https://gw.example.com/mcp"))
//!     .await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod oauth;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`; `format` of `"json"` selects
/// JSON output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?,
    }

    Ok(())
}
