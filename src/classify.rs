//! Error Classifier
//!
//! Maps gateway and downstream API responses to the error taxonomy.
//! Structured signals (challenge parameters, JSON error bodies, provider
//! headers) take precedence; the status code alone is the fallback.
//!
//! Recognised 403 body shapes:
//!
//! | Shape | Example |
//! |---|---|
//! | OAuth / RFC 6750 | `{"error": "insufficient_scope", "scope": "repo"}` |
//! | Slack-style | `{"ok": false, "error": "missing_scope", "needed": "chat:write"}` |
//! | GitHub-style | `{"message": "...OAuth App access restrictions...", "documentation_url": "..."}` |
//! | Google-style | `{"error": {"status": "PERMISSION_DENIED", "details": [{"reason": "..."}]}}` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

use crate::Error;
use crate::oauth::challenge::{Challenge, bearer_challenge};

/// Error codes meaning an organization or administrator policy blocks access
pub const ORG_POLICY_CODES: &[&str] = &[
    "org_policy_blocked",
    "organization_policy",
    "access_denied_by_policy",
    "oauth_app_access_restricted",
    "admin_policy_enforced",
    "org_internal",
    "team_access_not_allowed",
    "org_login_required",
    "ekm_access_denied",
    "enterprise_is_restricted",
    "domainpolicy",
    "orgpolicy",
];

/// Error codes meaning the credential lacks a required scope
pub const SCOPE_CODES: &[&str] = &[
    "insufficient_scope",
    "missing_scope",
    "access_token_scope_insufficient",
    "insufficientpermissions",
];

/// Message fragments GitHub-style APIs use for organization restrictions
const ORG_POLICY_MESSAGES: &[&str] = &[
    "oauth app access restrictions",
    "saml enforcement",
    "saml sso",
    "organization has enabled",
];

/// What a response means for the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// 2xx/3xx, or a status this subsystem does not interpret
    Pass,
    /// 401: credentials missing, expired or revoked
    Unauthorized {
        /// Bearer challenge, if the response carried one
        challenge: Option<Challenge>,
    },
    /// Credential lacks scopes; a new authorization can fix it
    InsufficientScope {
        /// Scopes the resource asked for (may be empty if it did not say)
        required_scopes: Vec<String>,
    },
    /// An administrator has to act; retrying will not help
    OrgPolicyBlocked {
        /// Server-provided error code
        error_code: String,
        /// Server-provided message
        message: String,
        /// Where access can be requested or approved
        approval_url: Option<String>,
    },
    /// Any other 403
    Forbidden {
        /// Server-provided error code
        error_code: Option<String>,
        /// Server-provided message
        message: String,
    },
    /// 429 or a provider's rate-limit 403
    RateLimited {
        /// Delay the server asked for
        retry_after: Option<Duration>,
    },
    /// 5xx
    Transient {
        /// HTTP status
        status: u16,
    },
}

impl Classification {
    /// Error to surface for this classification, `None` for [`Classification::Pass`]
    pub fn into_error(self, origin: Option<&str>, url: &str, status: u16, attempts: u32) -> Option<Error> {
        let origin = origin.map(String::from);
        Some(match self {
            Self::Pass => return None,
            Self::Unauthorized { .. } => Error::Unauthenticated {
                origin,
                url: url.to_string(),
                status,
            },
            Self::InsufficientScope { required_scopes } => Error::InsufficientScope {
                origin,
                status,
                required_scopes,
            },
            Self::OrgPolicyBlocked {
                error_code,
                message,
                approval_url,
            } => Error::OrgPolicyBlocked {
                origin,
                status,
                error_code,
                message,
                approval_url,
            },
            Self::Forbidden {
                error_code,
                message,
            } => Error::Forbidden {
                status,
                error_code,
                message,
            },
            Self::RateLimited { retry_after } => Error::RateLimited {
                attempts,
                retry_after,
            },
            Self::Transient { status } => Error::NetworkError {
                message: format!("{url} returned HTTP {status}"),
                status: Some(status),
            },
        })
    }
}

/// Classify a response from its status, headers and (possibly empty) body
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Classification {
    match status {
        StatusCode::UNAUTHORIZED => Classification::Unauthorized {
            challenge: bearer_challenge(headers),
        },
        StatusCode::FORBIDDEN => classify_forbidden(headers, body),
        StatusCode::TOO_MANY_REQUESTS => Classification::RateLimited {
            retry_after: retry_after(headers),
        },
        s if s.is_server_error() => Classification::Transient { status: s.as_u16() },
        _ => Classification::Pass,
    }
}

fn classify_forbidden(headers: &HeaderMap, body: &[u8]) -> Classification {
    // RFC 6750: the challenge is the authoritative scope signal
    if let Some(challenge) = bearer_challenge(headers) {
        if challenge
            .error()
            .is_some_and(|e| e.eq_ignore_ascii_case("insufficient_scope"))
        {
            return Classification::InsufficientScope {
                required_scopes: challenge.scopes(),
            };
        }
    }

    // GitHub: `X-GitHub-SSO: required; url=https://...`
    if let Some(sso) = headers.get("x-github-sso").and_then(|v| v.to_str().ok()) {
        if sso.trim_start().starts_with("required") {
            return Classification::OrgPolicyBlocked {
                error_code: "sso_required".to_string(),
                message: "Organization requires single sign-on authorization for this token"
                    .to_string(),
                approval_url: sso
                    .split(';')
                    .find_map(|part| part.trim().strip_prefix("url="))
                    .map(String::from),
            };
        }
    }

    if quota_exhausted(headers) {
        return Classification::RateLimited {
            retry_after: retry_after(headers),
        };
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(json) => classify_body(&json),
        Err(_) => Classification::Forbidden {
            error_code: None,
            message: fallback_message(body),
        },
    }
}

fn classify_body(json: &Value) -> Classification {
    let signal = BodySignal::extract(json);

    let matches = |set: &[&str]| {
        signal
            .codes
            .iter()
            .any(|c| set.contains(&c.to_ascii_lowercase().as_str()))
    };

    if matches(ORG_POLICY_CODES) || signal.mentions_org_policy() {
        return Classification::OrgPolicyBlocked {
            error_code: signal
                .codes
                .first()
                .cloned()
                .unwrap_or_else(|| "org_policy_blocked".to_string()),
            message: signal
                .message
                .unwrap_or_else(|| "Access blocked by organization policy".to_string()),
            approval_url: signal.documentation_url,
        };
    }

    if matches(SCOPE_CODES) {
        return Classification::InsufficientScope {
            required_scopes: signal.scopes,
        };
    }

    Classification::Forbidden {
        message: signal
            .message
            .or_else(|| signal.codes.first().cloned())
            .unwrap_or_else(|| "Forbidden".to_string()),
        error_code: signal.codes.into_iter().next(),
    }
}

/// Error signals pulled from the common JSON error shapes
#[derive(Debug, Default)]
struct BodySignal {
    codes: Vec<String>,
    message: Option<String>,
    documentation_url: Option<String>,
    scopes: Vec<String>,
}

impl BodySignal {
    fn extract(json: &Value) -> Self {
        let mut signal = Self::default();
        let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(String::from);

        match json.get("error") {
            // OAuth / Slack: `error` is a code string
            Some(Value::String(code)) => {
                signal.codes.push(code.clone());
                signal.message = str_field(json, "error_description");
            }
            // Google: `error` is an object with status and reasons
            Some(error @ Value::Object(_)) => {
                signal.message = str_field(error, "message");
                let reasons = ["errors", "details"]
                    .iter()
                    .filter_map(|k| error.get(*k).and_then(Value::as_array))
                    .flatten()
                    .filter_map(|item| str_field(item, "reason"));
                signal.codes.extend(reasons);
                signal.codes.extend(str_field(error, "status"));
            }
            _ => {}
        }

        if signal.message.is_none() {
            signal.message = str_field(json, "message");
        }
        signal.documentation_url = str_field(json, "documentation_url");

        // `scope` (RFC 6750 style) or Slack's `needed`, space or comma separated
        signal.scopes = ["scope", "needed"]
            .iter()
            .filter_map(|k| str_field(json, k))
            .flat_map(|s| {
                s.split([' ', ','])
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .collect();

        signal
    }

    fn mentions_org_policy(&self) -> bool {
        self.message.as_deref().is_some_and(|m| {
            let m = m.to_ascii_lowercase();
            ORG_POLICY_MESSAGES.iter().any(|needle| m.contains(needle))
        })
    }
}

fn fallback_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "Forbidden".to_string()
    } else {
        text.chars().take(200).collect()
    }
}

/// Secondary rate limits come back as 403 with the quota exhausted
pub fn quota_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or_default())
}
