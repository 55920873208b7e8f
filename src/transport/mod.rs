//! Authenticated transport for gateway requests

mod bearer;

pub use self::bearer::BearerTransport;

use async_trait::async_trait;
use reqwest::{Client, Request, Response};

use crate::config::Config;
use crate::{Error, Result};

/// Transport trait for outbound gateway calls
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the final response
    async fn send(&self, request: Request) -> Result<Response>;
}

/// HTTP client with the configured request timeout
pub fn http_client(config: &Config) -> Result<Client> {
    Client::builder()
        .timeout(config.timeouts.request)
        .connect_timeout(config.timeouts.request)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}
