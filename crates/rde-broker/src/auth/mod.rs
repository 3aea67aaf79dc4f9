//! Authentication and authorization
//!
//! Users present identity-provider tokens and may only reach agents they
//! own. Agents present client-credential tokens. Signing keys come from the
//! provider's JWKS endpoint through [`JwksCache`].

mod claims;
mod guard;
mod jwks;

pub use claims::{Identity, ServiceIdentity, TokenClaims, UserIdentity};
pub use guard::AuthGuard;
pub use jwks::JwksCache;

use axum::http::{header, HeaderMap};

/// Bearer token from the `Authorization` header, else from `cookie`
pub fn extract_token<'a>(headers: &'a HeaderMap, cookie: Option<&str>) -> Option<&'a str> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?.trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))?
            .trim();
        return (!token.is_empty()).then_some(token);
    }

    let cookie = cookie?;
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie)
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_token(&headers, None), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        assert_eq!(extract_token(&headers, Some("kuberde_session")), None);
    }

    #[test]
    fn test_cookie_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; kuberde_session=tok.en; other=1"),
        );
        assert_eq!(extract_token(&headers, Some("kuberde_session")), Some("tok.en"));
        assert_eq!(extract_token(&headers, None), None);
        assert_eq!(extract_token(&headers, Some("missing")), None);
    }
}
