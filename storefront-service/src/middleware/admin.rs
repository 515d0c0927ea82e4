//! Operator authentication for `/api/admin/*`.
//!
//! Admin routes take `Authorization: Bearer <ADMIN_API_TOKEN>`. An empty
//! configured token disables the admin surface entirely.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::utils::signature::constant_time_eq;

use crate::startup::AppState;

/// Marker extractor: present in a handler signature means the caller
/// presented the admin token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim())
}

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.admin.api_token.expose_secret();
        if expected.is_empty() {
            tracing::warn!("Admin request rejected: ADMIN_API_TOKEN is not configured");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Admin access is not configured"
            )));
        }

        let token = bearer_token(parts).ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing bearer token"))
        })?;

        if !constant_time_eq(token, expected) {
            tracing::warn!(path = %parts.uri.path(), "Admin request with invalid token");
            return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid admin token")));
        }

        Ok(AdminAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/admin/orders");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&parts(Some("Bearer abc"))), Some("abc"));
        assert_eq!(bearer_token(&parts(Some("bearer  abc "))), Some("abc"));
        assert_eq!(bearer_token(&parts(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&parts(Some("abc"))), None);
        assert_eq!(bearer_token(&parts(None)), None);
    }
}
