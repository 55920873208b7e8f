//! Loopback redirect receiver
//!
//! A minimal HTTP server on 127.0.0.1 that receives the authorization
//! redirect from the user's browser and hands its query parameters to the
//! flow. `state` is checked by the flow, not here.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Path the redirect is delivered to
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Authorization redirect query parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// Pending redirect for one authorization attempt.
///
/// Dropping the listener shuts its server down once in-flight responses
/// are written.
#[derive(Debug)]
pub struct RedirectListener {
    redirect_uri: String,
    receiver: oneshot::Receiver<CallbackParams>,
    shutdown: Option<CancellationToken>,
}

impl RedirectListener {
    /// Listener fed by something other than the loopback server, such as an
    /// embedder that receives redirects itself
    #[must_use]
    pub fn channel(redirect_uri: impl Into<String>) -> (oneshot::Sender<CallbackParams>, Self) {
        let (tx, rx) = oneshot::channel();
        let listener = Self {
            redirect_uri: redirect_uri.into(),
            receiver: rx,
            shutdown: None,
        };
        (tx, listener)
    }

    /// Redirect URI to register and send in the authorization request
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Wait for the redirect, giving up on cancellation or after `timeout`
    pub async fn wait(
        mut self,
        origin: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CallbackParams> {
        let failed = |code: &str, description: &str| Error::AuthorizationFailed {
            origin: origin.to_string(),
            error_code: code.to_string(),
            description: Some(description.to_string()),
        };

        tokio::select! {
            received = &mut self.receiver => {
                received.map_err(|_| failed("redirect_lost", "redirect receiver closed before a redirect arrived"))
            }
            () = cancel.cancelled() => {
                debug!(origin = %origin, "Authorization attempt cancelled");
                Err(failed("cancelled", "authorization attempt was cancelled"))
            }
            () = tokio::time::sleep(timeout) => {
                warn!(origin = %origin, timeout = ?timeout, "Timed out waiting for authorization redirect");
                Err(failed("timeout", "no authorization redirect received in time"))
            }
        }
    }
}

impl Drop for RedirectListener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
    }
}

type Pending = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// Bind the loopback receiver on `port` (0 = any free port)
pub async fn bind(port: u16) -> Result<RedirectListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind redirect receiver: {e}")))?;

    let actual_addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("Failed to get redirect receiver address: {e}")))?;

    let redirect_uri = format!("http://127.0.0.1:{}{CALLBACK_PATH}", actual_addr.port());
    info!(url = %redirect_uri, "Redirect receiver listening");

    let (tx, mut redirect) = RedirectListener::channel(redirect_uri);
    let pending: Pending = Arc::new(Mutex::new(Some(tx)));

    let app = Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(pending);

    let shutdown = CancellationToken::new();
    redirect.shutdown = Some(shutdown.clone());
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(error = %e, "Redirect receiver stopped");
        }
    });

    Ok(redirect)
}

/// Forward the first redirect; later ones only get a page
async fn handle_callback(
    State(pending): State<Pending>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(
        has_code = params.code.is_some(),
        error = ?params.error,
        "Received authorization redirect"
    );

    let page = match params.error.as_deref() {
        Some(error) => error_page(
            error,
            params
                .error_description
                .as_deref()
                .unwrap_or("The authorization server reported an error."),
        ),
        None if params.code.is_none() => {
            error_page("missing_code", "Authorization code not provided.")
        }
        None => success_page(),
    };

    if let Some(tx) = pending.lock().await.take() {
        // receiver gone means the attempt already ended
        let _ = tx.send(params);
    }

    Html(page)
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head><title>Authorization Received</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh;">
    <h1>Authorization Received</h1>
    <p>You can close this window and return to your application.</p>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorization Failed</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh;">
    <h1>Authorization Failed</h1>
    <p>{}</p>
    <p><code>{}</code></p>
</body>
</html>"#,
        escape_html(description),
        escape_html(error)
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
