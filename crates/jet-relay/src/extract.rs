//! Bearer token checks for the management API

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jet_token::{AccessScope, AccessTokenClaims, Presentation, ScopeClaims, TokenError, TokenKind};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::auth::TokenAuthority;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Scope {granted} does not grant {required}")]
    InsufficientScope {
        required: AccessScope,
        granted: AccessScope,
    },
}

/// HTTP status for a rejected token
pub fn token_status(error: &TokenError) -> StatusCode {
    match error {
        TokenError::WrongTokenKind { .. } | TokenError::WrongGateway(_) => StatusCode::FORBIDDEN,
        TokenError::SensitiveClaimUnencrypted => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNAUTHORIZED,
    }
}

impl AuthzError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthzError::MissingToken => StatusCode::UNAUTHORIZED,
            AuthzError::Token(e) => token_status(e),
            AuthzError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require a scope token granting `required`
pub fn authorize(
    authority: &TokenAuthority,
    headers: &HeaderMap,
    required: AccessScope,
) -> Result<ScopeClaims, AuthzError> {
    let token = bearer_token(headers).ok_or(AuthzError::MissingToken)?;

    let claims = match authority.validate(token, Some(TokenKind::Scope), Presentation::plain())? {
        AccessTokenClaims::Scope(claims) => claims,
        other => {
            return Err(TokenError::WrongTokenKind {
                expected: TokenKind::Scope,
                actual: other.kind(),
            }
            .into())
        }
    };

    if !claims.scope.grants(required) {
        warn!(required = %required, granted = %claims.scope, "Insufficient scope");
        return Err(AuthzError::InsufficientScope {
            required,
            granted: claims.scope,
        });
    }
    Ok(claims)
}
