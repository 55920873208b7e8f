//! `WWW-Authenticate` challenge parsing (RFC 7235, RFC 6750, RFC 9728)
//!
//! A 401 from an MCP gateway names its resource metadata document in the
//! Bearer challenge (`resource_metadata="<url>"`); a 403 may carry
//! `error="insufficient_scope"` together with the `scope` it wants.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};

/// One parsed authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Auth scheme, e.g. `Bearer`
    pub scheme: String,
    /// token68 credentials, when the challenge carries one instead of params
    pub token68: Option<String>,
    /// Auth params, keys lowercased
    params: HashMap<String, String>,
}

impl Challenge {
    fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            token68: None,
            params: HashMap::new(),
        }
    }

    /// Look up a parameter (case-insensitive name)
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether this is a Bearer challenge
    pub fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }

    /// `resource_metadata` URL (RFC 9728)
    pub fn resource_metadata(&self) -> Option<&str> {
        self.param("resource_metadata")
    }

    /// `error` code (RFC 6750)
    pub fn error(&self) -> Option<&str> {
        self.param("error")
    }

    /// `error_description`
    pub fn error_description(&self) -> Option<&str> {
        self.param("error_description")
    }

    /// Space-separated `scope` split into individual scopes
    pub fn scopes(&self) -> Vec<String> {
        self.param("scope")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

/// Parse every challenge in one `WWW-Authenticate` header value
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut parser = Parser {
        bytes: header.as_bytes(),
        pos: 0,
    };
    let mut challenges = Vec::new();
    let mut current: Option<Challenge> = None;

    loop {
        let saw_comma = parser.skip_separators();
        let Some(token) = parser.token() else {
            // stray byte we cannot interpret; skip it
            if parser.peek().is_some() {
                parser.pos += 1;
                continue;
            }
            break;
        };

        if parser.peek() == Some(b'=') {
            parser.pos += 1;
            let fresh = current
                .as_ref()
                .is_some_and(|c| c.params.is_empty() && c.token68.is_none());
            let ends_here = matches!(parser.peek(), None | Some(b'=' | b',' | b' ' | b'\t'));
            if fresh && !saw_comma && ends_here {
                // token68 with `=` padding, e.g. `Basic dXNlcg==`
                let mut padding = String::from("=");
                while parser.peek() == Some(b'=') {
                    padding.push('=');
                    parser.pos += 1;
                }
                if let Some(c) = current.as_mut() {
                    c.token68 = Some(format!("{token}{padding}"));
                }
                continue;
            }

            parser.skip_whitespace();
            let value = if parser.peek() == Some(b'"') {
                parser.quoted()
            } else {
                parser.token().unwrap_or_default()
            };
            if let Some(c) = current.as_mut() {
                c.params.insert(token.to_ascii_lowercase(), value);
            }
        } else if let Some(c) = current
            .as_mut()
            .filter(|c| c.params.is_empty() && c.token68.is_none() && !saw_comma)
        {
            c.token68 = Some(token);
        } else {
            if let Some(c) = current.take() {
                challenges.push(c);
            }
            current = Some(Challenge::new(&token));
        }
    }

    if let Some(c) = current {
        challenges.push(c);
    }
    challenges
}

/// First Bearer challenge across all `WWW-Authenticate` headers
pub fn bearer_challenge(headers: &HeaderMap) -> Option<Challenge> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_challenges)
        .find(Challenge::is_bearer)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace and commas; report whether a comma was crossed
    fn skip_separators(&mut self) -> bool {
        let mut saw_comma = false;
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' => {}
                b',' => saw_comma = true,
                _ => break,
            }
            self.pos += 1;
        }
        saw_comma
    }

    fn token(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b' ' | b'\t' | b',' | b'=' | b'"') {
                break;
            }
            self.pos += 1;
        }
        let end = self.pos;
        let token = (end > start)
            .then(|| String::from_utf8_lossy(&self.bytes[start..end]).into_owned());
        self.skip_whitespace();
        token
    }

    fn quoted(&mut self) -> String {
        // opening quote
        self.pos += 1;
        let mut out = Vec::new();
        while let Some(b) = self.peek() {
            self.pos += 1;
            match b {
                b'\\' => {
                    if let Some(escaped) = self.peek() {
                        out.push(escaped);
                        self.pos += 1;
                    }
                }
                b'"' => break,
                _ => out.push(b),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}
