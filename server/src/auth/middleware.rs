//! Authentication middleware.
//!
//! Bearer tokens are checked against `AUTH_TOKENS`; with none configured any
//! non-empty token is accepted.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Marker for a request that presented an accepted bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser;

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::Unauthorized("Missing authorization header"))?;

        let token = bearer_token(header)
            .ok_or(AppError::Unauthorized("Invalid authorization header format"))?;

        if !state.config.accepts_token(token) {
            tracing::warn!("Rejected bearer token");
            return Err(AppError::Unauthorized("Invalid bearer token"));
        }

        Ok(AuthUser)
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_required() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), Some(""));
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
