//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "MCP_GATEWAY_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OAuth client identity and requested scopes
    pub client: ClientConfig,
    /// Token lifecycle settings
    pub tokens: TokenConfig,
    /// Timeouts for network and interactive operations
    pub timeouts: TimeoutConfig,
    /// Retry configuration for transient failures
    pub retry: RetryConfig,
}

/// OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pre-registered client ID. When unset, dynamic registration is used
    /// if the authorization server supports it.
    pub client_id: Option<String>,
    /// Client name sent during dynamic registration
    pub client_name: String,
    /// Scopes to request (empty = the resource's advertised scopes)
    pub scopes: Vec<String>,
    /// Loopback port for the redirect receiver (0 = any free port)
    pub redirect_port: u16,
    /// Open the system browser for authorization
    pub open_browser: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_name: "MCP Gateway Auth".to_string(),
            scopes: Vec::new(),
            redirect_port: 0,
            open_browser: true,
        }
    }
}

/// Token lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Refresh when the access token expires within this margin
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Lifetime assumed when a token response has no `expires_in`
    #[serde(with = "humantime_serde")]
    pub default_lifetime: Duration,
    /// Credential store directory (default: `~/.mcp-gateway/oauth`)
    pub storage_dir: Option<PathBuf>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            default_lifetime: Duration::from_secs(3600),
            storage_dir: None,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on every HTTP request made by this crate
    #[serde(with = "humantime_serde")]
    pub request: Duration,
    /// Bound on waiting for the user to finish authorizing in the browser
    #[serde(with = "humantime_serde")]
    pub authorization: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            authorization: Duration::from_secs(300),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the retry or timeout bounds meaningless
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".to_string()));
        }
        if self.timeouts.request.is_zero() {
            return Err(Error::Config("timeouts.request must be non-zero".to_string()));
        }
        if self.timeouts.authorization.is_zero() {
            return Err(Error::Config(
                "timeouts.authorization must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Credential store directory, falling back to `~/.mcp-gateway/oauth`
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.tokens.storage_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".mcp-gateway").join("oauth"))
    }
}
