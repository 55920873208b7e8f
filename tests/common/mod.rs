//! Shared fixtures: mock authorization server and gateway, scripted user

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_gateway_auth::Result;
use mcp_gateway_auth::config::Config;
use mcp_gateway_auth::oauth::{
    AuthorizationServerMetadata, CallbackParams, InteractiveAuthorizer, OriginRegistration,
    RedirectListener, TokenSet,
};

pub const CLIENT_ID: &str = "test-client";
pub const REDIRECT_URI: &str = "http://127.0.0.1:8976/oauth/callback";

/// Config with a static client and fast backoff
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.client.client_id = Some(CLIENT_ID.to_string());
    config.retry.max_attempts = 3;
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(50);
    config.timeouts.request = Duration::from_secs(5);
    config.timeouts.authorization = Duration::from_secs(5);
    config
}

/// Authorization server metadata pointing at `auth`
pub fn server_metadata(auth: &MockServer) -> AuthorizationServerMetadata {
    let base = auth.uri();
    AuthorizationServerMetadata {
        issuer: base.clone(),
        authorization_endpoint: format!("{base}/authorize"),
        token_endpoint: format!("{base}/token"),
        revocation_endpoint: Some(format!("{base}/revoke")),
        registration_endpoint: None,
        scopes_supported: vec!["read".to_string(), "write".to_string()],
        code_challenge_methods_supported: vec!["S256".to_string()],
    }
}

pub fn registration(auth: &MockServer, gateway: &MockServer) -> OriginRegistration {
    OriginRegistration {
        server: Arc::new(server_metadata(auth)),
        resource: Some(format!("{}/mcp", gateway.uri())),
        scopes_supported: vec!["read".to_string()],
    }
}

/// Mount resource metadata on `gateway` and server metadata on `auth`
pub async fn mount_discovery(gateway: &MockServer, auth: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resource": format!("{}/mcp", gateway.uri()),
            "authorization_servers": [auth.uri()],
            "scopes_supported": ["read"]
        })))
        .mount(gateway)
        .await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::to_value(server_metadata(auth)).unwrap()))
        .mount(auth)
        .await;
}

/// `WWW-Authenticate` value naming the gateway's resource metadata
pub fn challenge(gateway: &MockServer) -> String {
    format!(
        r#"Bearer resource_metadata="{}/.well-known/oauth-protected-resource""#,
        gateway.uri()
    )
}

pub fn token_body(access: &str, refresh: Option<&str>, scope: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": scope
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::Value::String(refresh.to_string());
    }
    body
}

pub fn token_set(auth: &MockServer, access: &str, refresh: Option<&str>, expires_in: TimeDelta) -> TokenSet {
    TokenSet {
        access_token: access.to_string(),
        refresh_token: refresh.map(String::from),
        expires_at: Utc::now() + expires_in,
        granted_scopes: ["read".to_string()].into_iter().collect::<BTreeSet<_>>(),
        origin: auth.uri(),
        client_id: CLIENT_ID.to_string(),
    }
}

/// Requests received by `server` at `path`
pub async fn hits(server: &MockServer, request_path: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == request_path)
        .collect()
}

/// Form fields of a request body
pub fn form(request: &wiremock::Request) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(&request.body).into_owned().collect()
}

/// Plays the user: approves every authorization immediately
pub struct ScriptedUser {
    code: String,
    forge_state: bool,
    sender: Mutex<Option<oneshot::Sender<CallbackParams>>>,
    presented: AtomicUsize,
    urls: Mutex<Vec<Url>>,
}

impl ScriptedUser {
    fn new(code: &str, forge_state: bool) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            forge_state,
            sender: Mutex::new(None),
            presented: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn approving(code: &str) -> Arc<Self> {
        Self::new(code, false)
    }

    /// Returns a redirect whose `state` was not issued by us
    pub fn forging(code: &str) -> Arc<Self> {
        Self::new(code, true)
    }

    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Url {
        self.urls.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl InteractiveAuthorizer for ScriptedUser {
    async fn listen(&self) -> Result<RedirectListener> {
        let (tx, listener) = RedirectListener::channel(REDIRECT_URI);
        *self.sender.lock() = Some(tx);
        Ok(listener)
    }

    async fn present(&self, authorization_url: &Url) -> Result<()> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(authorization_url.clone());

        let state = authorization_url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned());
        let state = if self.forge_state {
            Some("forged-state".to_string())
        } else {
            state
        };

        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(CallbackParams {
                code: Some(self.code.clone()),
                state,
                ..CallbackParams::default()
            });
        }
        Ok(())
    }
}

/// Fails the test if asked to authorize
pub struct NoUser;

#[async_trait]
impl InteractiveAuthorizer for NoUser {
    async fn listen(&self) -> Result<RedirectListener> {
        panic!("interactive authorization was not expected");
    }

    async fn present(&self, _authorization_url: &Url) -> Result<()> {
        panic!("interactive authorization was not expected");
    }
}
