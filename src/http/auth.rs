//! Bearer-token authentication for every route.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::http::error::ApiError;
use crate::http::state::AppState;

/// Middleware enforcing `Authorization: Bearer <token>`.
///
/// Non-Bearer schemes, absent headers, and empty or mismatched tokens all
/// yield 401. Token comparison is constant-time.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if !token.is_empty() && token_matches(token, &state.config.bridge_token) => {
            next.run(request).await
        }
        _ => ApiError::Unauthorized.into_response(),
    }
}

/// Length-safe byte compare that does not short-circuit.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
