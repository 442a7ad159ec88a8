//! Bearer-token auth-challenge-and-retry, grounded on
//! `examples/other_examples/.../aconz2-program-explorer__peoci-src-ocidist.rs`'s
//! `auth_and_retry`, adapted from `reqwest` to `ureq` to stay aligned with
//! the teacher's HTTP client stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{AppError, AppResult};

/// Parsed `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

pub fn parse_www_authenticate(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for part in split_attrs(rest) {
        let (key, value) = part.split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Splits on commas that are not inside a quoted attribute value.
fn split_attrs(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(s[start..].trim());
    out
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
}

/// In-memory bearer-token cache keyed by `(registry, repository)`. Cheaply
/// `Clone`-able (an `Arc` around the map) so it can be handed to a
/// `spawn_blocking` worker alongside the rest of a push/pull's state.
#[derive(Default, Clone)]
pub struct TokenCache {
    tokens: Arc<Mutex<HashMap<(String, String), CachedToken>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        TokenCache {
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, registry: &str, repository: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(&(registry.to_string(), repository.to_string()))
            .map(|c| c.token.clone())
    }

    pub fn put(&self, registry: &str, repository: &str, token: String) {
        self.tokens.lock().unwrap().insert(
            (registry.to_string(), repository.to_string()),
            CachedToken { token },
        );
    }

    pub fn invalidate(&self, registry: &str, repository: &str) {
        self.tokens
            .lock()
            .unwrap()
            .remove(&(registry.to_string(), repository.to_string()));
    }
}

/// Fetches a bearer token from the realm named in the challenge.
pub fn fetch_token(
    challenge: &BearerChallenge,
    username: Option<&str>,
    password: Option<&str>,
) -> AppResult<String> {
    let mut url = format!("{}?", challenge.realm);
    if let Some(service) = &challenge.service {
        url.push_str(&format!("service={}&", urlencoding::encode(service)));
    }
    if let Some(scope) = &challenge.scope {
        url.push_str(&format!("scope={}&", urlencoding::encode(scope)));
    }

    let mut request = ureq::get(&url);
    if let (Some(user), Some(pass)) = (username, password) {
        let encoded = base64_basic_auth(user, pass);
        request = request.set("Authorization", &format!("Basic {encoded}"));
    }

    let resp = request
        .call()
        .map_err(|e| AppError::AuthFailed(format!("token request failed: {e}")))?;

    let body: serde_json::Value = resp
        .into_json()
        .map_err(|e| AppError::AuthFailed(format!("token response not JSON: {e}")))?;

    body.get("token")
        .or_else(|| body.get("access_token"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::AuthFailed("token response missing token field".to_string()))
}

fn base64_basic_auth(user: &str, pass: &str) -> String {
    // Minimal base64 encoder (standard alphabet, padded) so this module has
    // no dependency on a base64 crate beyond what basic-auth header encoding
    // needs.
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let input = format!("{user}:{pass}");
    let bytes = input.as_bytes();
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);

        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_bearer_challenge() {
        let header =
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/llama3:pull""#;
        let challenge = parse_www_authenticate(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/llama3:pull")
        );
    }

    #[test]
    fn parses_challenge_without_scope() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="example""#;
        let challenge = parse_www_authenticate(header).unwrap();
        assert!(challenge.scope.is_none());
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        assert!(parse_www_authenticate(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn token_cache_round_trips() {
        let cache = TokenCache::new();
        assert!(cache.get("registry.ollama.ai", "library/llama3").is_none());
        cache.put("registry.ollama.ai", "library/llama3", "abc".to_string());
        assert_eq!(
            cache.get("registry.ollama.ai", "library/llama3"),
            Some("abc".to_string())
        );
        cache.invalidate("registry.ollama.ai", "library/llama3");
        assert!(cache.get("registry.ollama.ai", "library/llama3").is_none());
    }

    #[test]
    fn basic_auth_matches_known_vector() {
        // "Aladdin:open sesame" -> "QWxhZGRpbjpvcGVuIHNlc2FtZQ==" (RFC 7617 example)
        assert_eq!(
            base64_basic_auth("Aladdin", "open sesame"),
            "QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
