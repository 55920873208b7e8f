//! Bearer transport integration tests: 401 recovery, 403 classification,
//! rate limiting, header passthrough

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use reqwest::Method;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{NoUser, ScriptedUser, challenge, hits, registration, test_config, token_body, token_set};
use mcp_gateway_auth::Error;
use mcp_gateway_auth::config::Config;
use mcp_gateway_auth::oauth::{CredentialStore, InteractiveAuthorizer, MemoryCredentialStore};
use mcp_gateway_auth::transport::BearerTransport;

/// Transport already bound to `auth`, holding a fresh `at-1` / `rt-1`
fn bound_transport(
    gateway: &MockServer,
    auth: &MockServer,
    authorizer: Arc<dyn InteractiveAuthorizer>,
) -> BearerTransport {
    bound_transport_with(&test_config(), gateway, auth, authorizer)
}

fn bound_transport_with(
    config: &Config,
    gateway: &MockServer,
    auth: &MockServer,
    authorizer: Arc<dyn InteractiveAuthorizer>,
) -> BearerTransport {
    let store = Arc::new(MemoryCredentialStore::new());
    store
        .save(&token_set(auth, "at-1", Some("rt-1"), TimeDelta::hours(1)))
        .unwrap();
    let transport = BearerTransport::from_config(config, store, authorizer).unwrap();
    transport.bind(&Url::parse(&gateway.uri()).unwrap(), registration(auth, gateway));
    transport
}

fn mcp_url(gateway: &MockServer) -> String {
    format!("{}/mcp", gateway.uri())
}

// =========================================================================
// 403 classification
// =========================================================================

#[tokio::test]
async fn org_policy_block_is_surfaced_without_reauthorization() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "message": "Although you appear to have the correct authorization credentials, the \
                        `acme` organization has enabled OAuth App access restrictions.",
            "documentation_url": "https://docs.github.com/articles/restricting-access-to-your-organization-s-data/"
        })))
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", None, "read")))
        .expect(0)
        .mount(&auth)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::POST, mcp_url(&gateway)).body("{}"))
        .await
        .unwrap_err();

    match &err {
        Error::OrgPolicyBlocked {
            origin,
            status,
            approval_url,
            ..
        } => {
            assert_eq!(origin.as_deref(), Some(auth.uri().as_str()));
            assert_eq!(*status, 403);
            assert!(approval_url.as_deref().unwrap().starts_with("https://docs.github.com/"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.guidance().unwrap().contains("administrator"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn sso_header_is_org_policy_with_approval_url() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("X-GitHub-SSO", "required; url=https://github.com/orgs/acme/sso?token=x"),
        )
        .expect(1)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::OrgPolicyBlocked {
            origin: Some(auth.uri()),
            status: 403,
            error_code: "sso_required".to_string(),
            message: "Organization requires single sign-on authorization for this token".to_string(),
            approval_url: Some("https://github.com/orgs/acme/sso?token=x".to_string()),
        }
    );
}

#[tokio::test]
async fn plain_forbidden_is_not_retried() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(403).set_body_string("repository is archived"))
        .expect(1)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::Forbidden {
            status: 403,
            error_code: None,
            message: "repository is archived".to_string(),
        }
    );
}

#[tokio::test]
async fn insufficient_scope_reauthorizes_with_combined_scopes() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .with_priority(1)
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(403).insert_header(
            "WWW-Authenticate",
            r#"Bearer error="insufficient_scope", scope="admin""#,
        ))
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), "read admin")))
        .expect(1)
        .mount(&auth)
        .await;

    let user = ScriptedUser::approving("code-admin");
    let transport = bound_transport(&gateway, &auth, user.clone());
    let response = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(user.presented(), 1);
    let scope = user
        .last_url()
        .query_pairs()
        .find(|(k, _)| k == "scope")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let scopes: Vec<&str> = scope.split(' ').collect();
    assert!(scopes.contains(&"admin"));
    assert!(scopes.contains(&"read"));

    let origin = transport.origin_for(&Url::parse(&gateway.uri()).unwrap()).unwrap();
    let cached = transport.manager().cached(&origin).unwrap();
    assert!(cached.granted_scopes.contains("admin"));
}

#[tokio::test]
async fn insufficient_scope_twice_is_surfaced() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(403).insert_header(
            "WWW-Authenticate",
            r#"Bearer error="insufficient_scope", scope="admin""#,
        ))
        .expect(2)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", None, "read")))
        .expect(1)
        .mount(&auth)
        .await;

    let transport = bound_transport(&gateway, &auth, ScriptedUser::approving("code"));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::InsufficientScope {
            origin: Some(auth.uri()),
            status: 403,
            required_scopes: vec!["admin".to_string()],
        }
    );
}

// =========================================================================
// 401 recovery
// =========================================================================

#[tokio::test]
async fn rejected_token_is_refreshed_and_retried_once() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge(&gateway).as_str()))
        .expect(1)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), "read")))
        .expect(1)
        .mount(&auth)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let response = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn second_unauthorized_after_refresh_is_unauthenticated() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge(&gateway).as_str()))
        .expect(2)
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), "read")))
        .expect(1)
        .mount(&auth)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::Unauthenticated {
            origin: Some(auth.uri()),
            url: mcp_url(&gateway),
            status: 401,
        }
    );
}

// =========================================================================
// Rate limiting and transient failures
// =========================================================================

#[tokio::test]
async fn rate_limited_requests_back_off_then_fail() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(3)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::RateLimited {
            attempts: 3,
            retry_after: Some(Duration::ZERO),
        }
    );
    assert_eq!(hits(&gateway, "/mcp").await.len(), 3);
}

#[tokio::test]
async fn exhausted_quota_forbidden_is_retried_as_rate_limit() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({
                    "message": "You have exceeded a secondary rate limit."
                })),
        )
        .expect(3)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::RateLimited {
            attempts: 3,
            retry_after: Some(Duration::ZERO),
        }
    );
}

#[tokio::test]
async fn slow_gateway_times_out_as_network_error() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&gateway)
        .await;

    let mut config = test_config();
    config.timeouts.request = Duration::from_millis(100);
    config.retry.max_attempts = 1;
    let transport = bound_transport_with(&config, &gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    match err {
        Error::NetworkError { message, status } => {
            assert!(message.contains("timed out"), "unexpected message: {message}");
            assert_eq!(status, None);
        }
        other => panic!("expected a network error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_then_surfaced() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let err = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NetworkError { status: Some(502), .. }), "got {err:?}");
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&gateway)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let response = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(hits(&gateway, "/mcp").await.len(), 2);
}

// =========================================================================
// Passthrough
// =========================================================================

#[tokio::test]
async fn request_headers_and_body_are_passed_through() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-1"))
        .and(header("x-mcp-toolsets", "repos,issues"))
        .and(header("x-mcp-readonly", "true"))
        .and(body_string_contains("tools/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("listed"))
        .expect(1)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let response = transport
        .execute(
            transport
                .request(Method::POST, mcp_url(&gateway))
                .header("X-MCP-Toolsets", "repos,issues")
                .header("X-MCP-Readonly", "true")
                .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "listed");
}

#[tokio::test]
async fn non_auth_statuses_are_returned_to_the_caller() {
    let gateway = MockServer::start().await;
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such tool"))
        .expect(1)
        .mount(&gateway)
        .await;

    let transport = bound_transport(&gateway, &auth, Arc::new(NoUser));
    let response = transport
        .execute(transport.request(Method::GET, mcp_url(&gateway)))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
