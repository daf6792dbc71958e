//! HTTP Basic authentication middleware.
//!
//! Applied to every route except `/api/health`. Credential comparison is
//! constant-time: it always walks `max(len(a), len(b))` bytes and folds
//! the length check into the final result, so mismatches cannot be
//! distinguished by how early they diverge.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.auth_enabled {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|header| {
            check_credentials(header, &state.config.auth_username, &state.config.auth_password)
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

fn check_credentials(header: &str, username: &str, password: &str) -> bool {
    let encoded = match header.strip_prefix("Basic ") {
        Some(encoded) => encoded.trim(),
        None => return false,
    };
    let decoded = match BASE64.decode(encoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    let text = match String::from_utf8(decoded) {
        Ok(text) => text,
        Err(_) => return false,
    };
    let Some((user, pass)) = text.split_once(':') else {
        return false;
    };

    // Bitwise-and, not &&: both comparisons always run.
    constant_time_eq(user.as_bytes(), username.as_bytes())
        & constant_time_eq(pass.as_bytes(), password.as_bytes())
}

/// Compare over the longer of the two lengths, folding the length check
/// into the accumulated difference; never short-circuits on inequality.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
