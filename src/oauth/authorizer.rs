//! Interactive authorization
//!
//! The part of the PKCE flow that involves the user: presenting the
//! authorization URL and receiving the redirect.

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use super::callback::{self, RedirectListener};
use crate::Result;
use crate::config::ClientConfig;

/// Presents authorization URLs to the user and receives redirects
#[async_trait]
pub trait InteractiveAuthorizer: Send + Sync {
    /// Start receiving redirects for one attempt; the listener's
    /// `redirect_uri` is used in the authorization request
    async fn listen(&self) -> Result<RedirectListener>;

    /// Send the user to `authorization_url`
    async fn present(&self, authorization_url: &Url) -> Result<()>;
}

/// Opens the system browser and receives the redirect on a loopback port
#[derive(Debug, Clone)]
pub struct BrowserAuthorizer {
    redirect_port: u16,
    open_browser: bool,
}

impl BrowserAuthorizer {
    /// Create an authorizer from client configuration
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            redirect_port: config.redirect_port,
            open_browser: config.open_browser,
        }
    }
}

#[async_trait]
impl InteractiveAuthorizer for BrowserAuthorizer {
    async fn listen(&self) -> Result<RedirectListener> {
        callback::bind(self.redirect_port).await
    }

    async fn present(&self, authorization_url: &Url) -> Result<()> {
        if self.open_browser {
            info!(url = %authorization_url, "Opening browser for authorization");
            match open::that(authorization_url.as_str()) {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Failed to open browser automatically"),
            }
        }
        // stdout may carry protocol traffic
        eprintln!("\nPlease authorize this client by visiting:\n{authorization_url}\n");
        Ok(())
    }
}
