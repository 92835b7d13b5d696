use std::collections::HashMap;

use hyper::HeaderMap;
use hyper::StatusCode;
use hyper::header::AUTHORIZATION;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::types::AccessMode;
use crate::types::AccessState;

pub const TOKEN_HEADER: &str = "x-cfshare-token";
pub const BASIC_USERNAME: &str = "cfshare";

/// Outcome of an access-control check; callers translate this into an HTTP
/// response.
pub enum AccessDecision {
    Allow,
    Unauthorized,
    PathNotAllowed { path: String },
}

pub fn new_token() -> String {
    let mut bytes = [0u8; 16]; // 128 bits
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_basic_password() -> String {
    let mut bytes = [0u8; 12]; // 96 bits
    OsRng.fill_bytes(&mut bytes);
    base64_url_no_pad(&bytes)
}

fn base64_url_no_pad(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Mask a secret for user-facing display: `"abc***ef"` keeps the first 3
/// and last 2 characters. Short secrets are masked entirely.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("token") {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

fn extract_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// `protect_origin = false` always allows.
pub fn authorize(access: &AccessState, headers: &HeaderMap, query: Option<&str>) -> AccessDecision {
    if !access.protect_origin || access.mode == AccessMode::None {
        return AccessDecision::Allow;
    }

    match access.mode {
        AccessMode::None => AccessDecision::Allow,
        AccessMode::Token => {
            let Some(expected) = access.token.as_deref() else {
                return AccessDecision::Unauthorized;
            };
            let candidate = extract_query_token(query)
                .or_else(|| {
                    headers
                        .get(TOKEN_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string())
                })
                .or_else(|| extract_bearer_token(headers));
            match candidate {
                Some(candidate) if constant_time_eq(&candidate, expected) => AccessDecision::Allow,
                _ => AccessDecision::Unauthorized,
            }
        }
        AccessMode::Basic => {
            let (Some(expected_user), Some(expected_pass)) =
                (access.username.as_deref(), access.password.as_deref())
            else {
                return AccessDecision::Unauthorized;
            };
            match extract_basic_auth(headers) {
                Some((user, pass))
                    if constant_time_eq(&user, expected_user)
                        && constant_time_eq(&pass, expected_pass) =>
                {
                    AccessDecision::Allow
                }
                _ => AccessDecision::Unauthorized,
            }
        }
    }
}

/// Allow iff `allowlist` is empty, or `path` equals a prefix or begins with
/// a prefix followed by `/` (exact segment match).
pub fn path_allowed(allowlist: &[String], path: &str) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|prefix| {
        path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
    })
}

pub fn check_path(access: &AccessState, path: &str) -> AccessDecision {
    if path_allowed(&access.allowlist_paths, path) {
        AccessDecision::Allow
    } else {
        AccessDecision::PathNotAllowed {
            path: path.to_string(),
        }
    }
}

pub fn unauthorized_body(requires_basic: bool) -> (StatusCode, Vec<(&'static str, String)>, serde_json::Value) {
    let mut headers = Vec::new();
    if requires_basic {
        headers.push((
            "www-authenticate",
            "Basic realm=\"cfshare\"".to_string(),
        ));
    }
    (
        StatusCode::UNAUTHORIZED,
        headers,
        json!({"error": "unauthorized"}),
    )
}

pub fn path_not_allowed_body(path: &str) -> serde_json::Value {
    json!({"error": "path_not_allowed", "path": path})
}

/// For `get` responses: the masked view of a session's secrets, never the
/// raw value.
pub fn masked_access_info(access: &AccessState) -> HashMap<&'static str, String> {
    let mut info = HashMap::new();
    if let Some(token) = &access.token {
        info.insert("token", mask_secret(token));
    }
    if let Some(password) = &access.password {
        info.insert("password", mask_secret(password));
    }
    if let Some(username) = &access.username {
        info.insert("username", username.clone());
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(mode: AccessMode) -> AccessState {
        AccessState {
            mode,
            protect_origin: true,
            token: Some("supersecrettoken".to_string()),
            username: Some(BASIC_USERNAME.to_string()),
            password: Some("password123".to_string()),
            allowlist_paths: Vec::new(),
        }
    }

    #[test]
    fn mask_secret_keeps_head_and_tail() {
        assert_eq!(mask_secret("abcdefgh"), "abc***gh");
    }

    #[test]
    fn mask_secret_hides_short_values() {
        assert_eq!(mask_secret("abcd"), "****");
    }

    #[test]
    fn token_via_query_allows() {
        let a = access(AccessMode::Token);
        let headers = HeaderMap::new();
        let decision = authorize(&a, &headers, Some("token=supersecrettoken"));
        assert!(matches!(decision, AccessDecision::Allow));
    }

    #[test]
    fn token_mismatch_is_unauthorized() {
        let a = access(AccessMode::Token);
        let headers = HeaderMap::new();
        let decision = authorize(&a, &headers, Some("token=wrong"));
        assert!(matches!(decision, AccessDecision::Unauthorized));
    }

    #[test]
    fn none_mode_always_allows() {
        let mut a = access(AccessMode::None);
        a.protect_origin = false;
        let headers = HeaderMap::new();
        assert!(matches!(authorize(&a, &headers, None), AccessDecision::Allow));
    }

    #[test]
    fn path_allowlist_exact_segment_match() {
        let allow = vec!["/docs".to_string()];
        assert!(path_allowed(&allow, "/docs"));
        assert!(path_allowed(&allow, "/docs/readme.md"));
        assert!(!path_allowed(&allow, "/docsx"));
    }
}
