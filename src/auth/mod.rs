//! Request authentication and authorization.

pub mod access_context;
pub mod lockout;
pub mod privilege;

use thiserror::Error;

/// Authentication schemes a resource may advertise in its challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

impl AuthScheme {
    pub fn challenge(self, realm: &str) -> String {
        match self {
            AuthScheme::Basic => format!("Basic realm=\"{realm}\""),
            AuthScheme::Bearer => format!("Bearer realm=\"{realm}\""),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization required")]
    AuthorizationRequired {
        realm: String,
        schemes: Vec<AuthScheme>,
    },
    #[error("authentication failed")]
    AuthenticationFailed { realm: String },
    #[error("token expired")]
    TokenExpired {
        realm: String,
        schemes: Vec<AuthScheme>,
    },
    #[error("token invalid: {message}")]
    TokenInvalid {
        realm: String,
        schemes: Vec<AuthScheme>,
        message: String,
    },
    #[error("insufficient privilege")]
    PrivilegeLacking,
    #[error("account temporarily locked")]
    RateLimited,
}
