//! Viewer extraction from bearer tokens.
//!
//! Token verification is the upstream PDS's problem; here we only need the
//! subject DID, so the JWT payload is decoded without checking the
//! signature. Tokens carry the DID in `sub` (PDS and entryway tokens) or
//! `iss` (some service tokens).

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::ApiError;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

const VALID_SCOPES: &[&str] = &[
    "com.atproto.access",
    "com.atproto.appPass",
    "com.atproto.appPassPrivileged",
];

/// Extract the viewer DID from an `Authorization: Bearer` header, if any.
pub fn viewer_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    let token = auth.strip_prefix("Bearer ")?;

    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;

    if let Some(scope) = &claims.scope {
        if !VALID_SCOPES.contains(&scope.as_str()) {
            return None;
        }
    }

    let did = claims
        .sub
        .filter(|s| s.starts_with("did:"))
        .or(claims.iss.filter(|s| s.starts_with("did:")))?;
    Some(did)
}

/// Like [`viewer_from_headers`] but required.
pub fn require_viewer(headers: &HeaderMap) -> Result<String, ApiError> {
    viewer_from_headers(headers).ok_or(ApiError::AuthRequired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn make_token(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        format!("{header}.{payload}.fakesig")
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_extracts_sub_did() {
        let token = make_token(serde_json::json!({
            "sub": "did:plc:viewer",
            "scope": "com.atproto.access"
        }));
        assert_eq!(
            viewer_from_headers(&headers_with(&token)).as_deref(),
            Some("did:plc:viewer")
        );
    }

    #[test]
    fn test_falls_back_to_iss() {
        let token = make_token(serde_json::json!({
            "sub": "not-a-did",
            "iss": "did:plc:service"
        }));
        assert_eq!(
            viewer_from_headers(&headers_with(&token)).as_deref(),
            Some("did:plc:service")
        );
    }

    #[test]
    fn test_rejects_bad_scope() {
        let token = make_token(serde_json::json!({
            "sub": "did:plc:viewer",
            "scope": "com.atproto.refresh"
        }));
        assert!(viewer_from_headers(&headers_with(&token)).is_none());
    }

    #[test]
    fn test_missing_header() {
        assert!(viewer_from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_malformed_token() {
        assert!(viewer_from_headers(&headers_with("garbage")).is_none());
        assert!(viewer_from_headers(&headers_with("a.b.c")).is_none());
    }

    #[test]
    fn test_require_viewer_errors_without_token() {
        assert!(matches!(
            require_viewer(&HeaderMap::new()),
            Err(ApiError::AuthRequired)
        ));
    }
}
