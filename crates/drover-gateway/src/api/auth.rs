//! Bearer-token authentication.
//!
//! The configured token is hashed once at startup and only the digest is
//! kept. Presented tokens are hashed before comparison so the check is
//! constant-time and blind to the token length. No configured token means
//! the API runs open.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

use super::error_response;

pub fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

/// Gate every request behind `Authorization: Bearer <token>` when a token
/// is configured.
pub async fn require_bearer_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token_hash.clone() else {
        // Open mode.
        return next.run(req).await;
    };

    let presented = bearer_token(&req);
    if !token_matches(expected.as_slice(), presented.as_deref()) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing bearer token");
    }
    next.run(req).await
}

/// The token carried in the `Authorization` header, if it is well-formed.
fn bearer_token(req: &Request) -> Option<String> {
    let raw = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

/// Compare a presented token against the expected digest.
fn token_matches(expected: &[u8], presented: Option<&str>) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let digest = Sha256::digest(presented.as_bytes());
    digest.as_slice().ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth(value: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder();
        if let Some(value) = value {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn token_matches_only_the_configured_token() {
        let expected = hash_token("s3cret");
        assert!(token_matches(&expected, Some("s3cret")));
        assert!(!token_matches(&expected, Some("guess")));
        assert!(!token_matches(&expected, Some("")));
        assert!(!token_matches(&expected, None));
    }

    #[test]
    fn bearer_token_extraction() {
        let req = request_with_auth(Some("Bearer  abc123 "));
        assert_eq!(bearer_token(&req).as_deref(), Some("abc123"));

        // Wrong scheme, empty token, and missing header all fail closed.
        assert!(bearer_token(&request_with_auth(Some("Basic abc123"))).is_none());
        assert!(bearer_token(&request_with_auth(Some("Bearer "))).is_none());
        assert!(bearer_token(&request_with_auth(None)).is_none());
    }
}
