//! Handler error type.
//!
//! Everything a handler can fail with collapses into an [`ApiError`]:
//! a status code, an OAuth2-style JSON body, and optionally a
//! `WWW-Authenticate` challenge for 401s.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::{AuthError, AuthScheme};
use crate::registry::RegistryError;
use crate::token::TokenError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: String,
    pub challenge: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        ApiError {
            status,
            error,
            description: description.into(),
            challenge: None,
        }
    }

    pub fn with_challenge(mut self, challenge: String) -> Self {
        self.challenge = Some(challenge);
        self
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_grant", description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, "invalid_client", description)
    }

    pub fn unsupported_grant_type() -> Self {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "unsupported grant type",
        )
    }

    /// Generic credential failure. Deliberately does not distinguish an
    /// unknown account from a wrong password.
    pub fn authn_failed() -> Self {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "authentication failed",
        )
    }

    pub fn token_expired(realm: &str, schemes: &[AuthScheme]) -> Self {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_grant",
            "the provided token is expired",
        )
        .with_challenge(challenge_line(realm, schemes))
    }

    pub fn authorization_required(realm: &str, schemes: &[AuthScheme]) -> Self {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authorization required",
        )
        .with_challenge(challenge_line(realm, schemes))
    }

    pub fn privilege_lacking() -> Self {
        ApiError::new(
            StatusCode::FORBIDDEN,
            "access_denied",
            "insufficient privilege",
        )
    }

    /// Lockout refusal. Carries no account detail at all.
    pub fn rate_limited() -> Self {
        ApiError::new(
            StatusCode::FORBIDDEN,
            "access_denied",
            "too many authentication failures",
        )
    }

    pub fn service_unavailable(description: impl Into<String>) -> Self {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "temporarily_unavailable",
            description,
        )
    }
}

fn challenge_line(realm: &str, schemes: &[AuthScheme]) -> String {
    schemes
        .iter()
        .map(|s| s.challenge(realm))
        .collect::<Vec<_>>()
        .join(", ")
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.error,
            "error_description": self.description,
        }));
        let mut response = (self.status, body).into_response();
        if let Some(challenge) = self.challenge {
            let value = HeaderValue::from_str(&challenge)
                .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(what) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", what)
            }
            RegistryError::Unavailable(e) => {
                tracing::warn!(error = %e, "registry unavailable");
                ApiError::service_unavailable("registry unavailable")
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Parse(message) => ApiError::invalid_grant(message),
            TokenError::Expired => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_grant",
                "the provided token is expired",
            ),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::AuthorizationRequired { realm, schemes } => {
                ApiError::authorization_required(&realm, &schemes)
            }
            AuthError::AuthenticationFailed { .. } => ApiError::authn_failed(),
            AuthError::TokenExpired { realm, schemes } => ApiError::token_expired(&realm, &schemes),
            AuthError::TokenInvalid {
                realm,
                schemes,
                message,
            } => ApiError::new(StatusCode::UNAUTHORIZED, "invalid_grant", message)
                .with_challenge(challenge_line(&realm, &schemes)),
            AuthError::PrivilegeLacking => ApiError::privilege_lacking(),
            AuthError::RateLimited => ApiError::rate_limited(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_lists_every_scheme() {
        let line = challenge_line("https://cell.example/__token", &[
            AuthScheme::Bearer,
            AuthScheme::Basic,
        ]);
        assert_eq!(
            line,
            "Bearer realm=\"https://cell.example/__token\", Basic realm=\"https://cell.example/__token\""
        );
    }

    #[test]
    fn registry_outage_maps_to_503() {
        let err: ApiError = RegistryError::Unavailable(anyhow::anyhow!("down")).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        let err: ApiError = RegistryError::NotFound("cell x".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
