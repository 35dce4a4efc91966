//! Optional shared-secret bearer token gate.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use super::server::AppState;
use crate::error::Error;

/// Reject requests without the configured bearer token.
///
/// Passes everything through when no token is configured.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(expected) = state.auth_token.as_ref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let has_header = provided.is_some();
    let authorized = provided.is_some_and(|token| tokens_match(token, expected.expose_secret()));

    if authorized {
        return Ok(next.run(request).await);
    }
    tracing::warn!(
        path = %request.uri().path(),
        has_header = has_header,
        "Rejected request with missing or invalid bearer token"
    );
    Err(Error::Unauthorized)
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
