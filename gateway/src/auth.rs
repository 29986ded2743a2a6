//! API key authentication for the chat route.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::AppState;

/// Authenticated caller, attached to the request by [`require_api_key`].
///
/// Carries only the key's fingerprint so handlers can log who called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerKey {
    pub fingerprint: String,
}

/// Set of accepted API keys.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: HashSet<String>,
}

impl ApiKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Check the request's `Authorization` header against the key set.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<CallerKey, GatewayError> {
        let token = bearer_token(headers)?;
        let fingerprint = fingerprint(token);
        if !self.contains(token) {
            tracing::warn!(key = %fingerprint, "Invalid API key");
            return Err(GatewayError::InvalidApiKey);
        }
        Ok(CallerKey { fingerprint })
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// The header must split on single spaces into exactly two parts; the scheme
/// is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(GatewayError::MissingAuthorization)?
        .to_str()
        .map_err(|_| GatewayError::MalformedAuthorization)?;

    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
            Ok(token.trim())
        }
        _ => Err(GatewayError::MalformedAuthorization),
    }
}

/// Short SHA-256 fingerprint of a key, safe to log.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..6])
}

/// Middleware that requires a valid API key.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.api_keys.authenticate(request.headers()) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_state, TEST_API_KEY};
    use axum::body::{to_bytes, Body};
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use axum::{middleware, Extension, Router};
    use rstest::rstest;
    use tower::ServiceExt;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[rstest]
    #[case("Bearer sk-test", "sk-test")]
    #[case("bearer sk-test", "sk-test")]
    #[case("BEARER sk-test", "sk-test")]
    fn test_bearer_token_accepts_any_scheme_case(#[case] header: &str, #[case] expected: &str) {
        let headers = headers_with_auth(header);
        assert_eq!(bearer_token(&headers).unwrap(), expected);
    }

    #[rstest]
    #[case("Bearer")]
    #[case("Basic dXNlcjpwYXNz")]
    #[case("Bearer  sk-test")]
    #[case("Bearer sk-test extra")]
    #[case("sk-test")]
    fn test_bearer_token_rejects_malformed(#[case] header: &str) {
        let headers = headers_with_auth(header);
        assert!(matches!(
            bearer_token(&headers),
            Err(GatewayError::MalformedAuthorization)
        ));
    }

    #[test]
    fn test_missing_header() {
        assert!(matches!(
            bearer_token(&HeaderMap::new()),
            Err(GatewayError::MissingAuthorization)
        ));
    }

    #[test]
    fn test_authenticate() {
        let keys = ApiKeys::new(["sk-one", "sk-two"]);
        assert_eq!(keys.len(), 2);
        let caller = keys.authenticate(&headers_with_auth("Bearer sk-two")).unwrap();
        assert_eq!(caller.fingerprint, fingerprint("sk-two"));
        assert!(matches!(
            keys.authenticate(&headers_with_auth("Bearer sk-three")),
            Err(GatewayError::InvalidApiKey)
        ));
    }

    #[test]
    fn test_no_keys_rejects_everything() {
        let keys = ApiKeys::default();
        assert!(keys.is_empty());
        assert!(matches!(
            keys.authenticate(&headers_with_auth("Bearer anything")),
            Err(GatewayError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn test_middleware_attaches_caller_fingerprint() {
        let state = test_state(vec!["http://127.0.0.1:1".to_string()]);
        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(caller): Extension<CallerKey>| async move { caller.fingerprint }),
            )
            .route_layer(middleware::from_fn_with_state(state, require_api_key));

        let response = app
            .oneshot(
                axum::http::Request::get("/whoami")
                    .header(AUTHORIZATION, format!("Bearer {}", TEST_API_KEY))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], fingerprint(TEST_API_KEY).as_bytes());
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = fingerprint("sk-secret");
        assert_eq!(a, fingerprint("sk-secret"));
        assert_ne!(a, fingerprint("sk-other"));
        assert_eq!(a.len(), 12);
        assert!(!a.contains("secret"));
    }
}
