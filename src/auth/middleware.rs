//! Authentication middleware — validates bearer tokens issued by Auth.

use crate::auth::{claims::Claims, verifier::AuthVerifier};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Validates the bearer token on every request and inserts `Claims` into the
/// request extensions so downstream handlers can read the authenticated user.
pub async fn auth_middleware(
    State(verifier): State<Arc<AuthVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let token = token_from_query
        .or(token_from_header)
        .ok_or(AuthError::MissingToken)?;

    let claims = verifier
        .verify(&token)
        .await
        .map_err(|_| AuthError::InvalidToken)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Requires the authenticated caller to hold the `admin` role. Must run after
/// `auth_middleware` so `Claims` is already present in extensions.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AuthError> {
    let is_admin = req
        .extensions()
        .get::<Claims>()
        .map(|c| c.is_admin())
        .unwrap_or(false);

    if !is_admin {
        return Err(AuthError::Forbidden);
    }

    Ok(next.run(req).await)
}

pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "Admin role required"),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};
    use uuid::Uuid;

    #[test]
    fn test_auth_error_responses() {
        assert_eq!(
            AuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_extract_claims_from_request() {
        let mut req = HttpRequest::new(Body::empty());
        assert!(extract_claims(&req).is_none());

        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: 1234567890,
            roles: vec!["player".to_string()],
        };
        req.extensions_mut().insert(claims.clone());

        let extracted = extract_claims(&req);
        assert!(extracted.is_some());
        assert_eq!(extracted.unwrap().sub, claims.sub);
    }
}
