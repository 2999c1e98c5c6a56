//! Bearer token authentication.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ApiError;
use super::handlers::AppState;

/// Scope required to request exports.
pub const ADMIN_SCOPE: &str = "admin";

/// `scope` claim: a single scope or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeClaim {
    One(String),
    Many(Vec<String>),
}

impl Default for ScopeClaim {
    fn default() -> Self {
        ScopeClaim::Many(Vec::new())
    }
}

impl ScopeClaim {
    pub fn contains(&self, scope: &str) -> bool {
        match self {
            ScopeClaim::One(s) => s == scope,
            ScopeClaim::Many(list) => list.iter().any(|s| s == scope),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub email: String,
    #[serde(default)]
    pub scope: ScopeClaim,
    pub exp: u64,
}

/// Authenticated administrator, inserted as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminContext {
    pub email: String,
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    match authorize(req.headers(), &state.jwt_secret) {
        Ok(admin) => {
            req.extensions_mut().insert(admin);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

fn authorize(headers: &HeaderMap, secret: &str) -> Result<AdminContext, ApiError> {
    let token = extract_bearer(headers).ok_or(ApiError::Unauthorized)?;

    let claims = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        debug!(error = %e, "Rejected bearer token");
        ApiError::Unauthorized
    })?
    .claims;

    if !claims.scope.contains(ADMIN_SCOPE) {
        return Err(ApiError::Forbidden);
    }

    Ok(AdminContext {
        email: claims.email,
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer  "));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer(&headers), Some("abc.def"));
    }

    #[test]
    fn test_scope_claim_accepts_string_or_list() {
        let one: ScopeClaim = serde_json::from_str(r#""admin""#).unwrap();
        let many: ScopeClaim = serde_json::from_str(r#"["user","admin"]"#).unwrap();
        let none: ScopeClaim = serde_json::from_str(r#"["user"]"#).unwrap();

        assert!(one.contains(ADMIN_SCOPE));
        assert!(many.contains(ADMIN_SCOPE));
        assert!(!none.contains(ADMIN_SCOPE));
    }
}
