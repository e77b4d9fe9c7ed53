//! Introspection endpoint: `POST /{cell}/__introspect`.
//!
//! RFC 7662-shaped. Only trusted callers get an answer: the unit master,
//! unit-user bearers, the configured resource-server credentials, or a
//! client authenticating with its own trans-cell assertion. Everything a
//! caller could learn from an invalid token is folded into a bare
//! `{"active": false}`.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::{Form, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::token::client_auth;
use crate::app::AppState;
use crate::auth::access_context::{AccessContext, ResolverDeps};
use crate::auth::AuthScheme;
use crate::token::RoleRef;

#[derive(Debug, Deserialize)]
pub struct IntrospectForm {
    pub token: Option<String>,
}

pub async fn introspect(
    State(state): State<AppState>,
    Path(cell_name): Path<String>,
    headers: HeaderMap,
    Form(form): Form<IntrospectForm>,
) -> Result<Json<Value>, ApiError> {
    let cell = state.registry.get_cell(&cell_name).await?;
    let realm = format!("{}__token", cell.url);
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(header_value) = authorization else {
        return Err(ApiError::authorization_required(
            &realm,
            &[AuthScheme::Bearer, AuthScheme::Basic],
        ));
    };

    let allowed = if header_value.starts_with("Bearer ") {
        let deps = ResolverDeps {
            config: &state.config,
            codec: &state.codec,
            registry: state.registry.as_ref(),
            lockout: &state.lockout,
        };
        let ctx = AccessContext::resolve(Some(header_value), &cell, &state.config.unit_url, deps)
            .await?;
        ctx.is_unit_user_token()
    } else if let Some(value) = header_value.strip_prefix("Basic ") {
        basic_caller_allowed(&state, &cell, value.trim()).await?
    } else {
        false
    };
    if !allowed {
        tracing::debug!(cell = %cell.name, "introspection caller refused");
        return Err(ApiError::privilege_lacking());
    }

    let raw = form
        .token
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("token missing"))?;
    let now = Utc::now().timestamp();
    match state
        .codec
        .parse_at(raw, &cell.url, &state.config.unit_url, now)
    {
        Ok(token) => Ok(Json(json!({
            "active": true,
            "iss": token.issuer,
            "sub": token.subject,
            "aud": token.audience,
            "exp": token.expires_at,
            "iat": token.issued_at,
            "p_roles": token.roles.iter().map(RoleRef::qualified).collect::<Vec<_>>(),
        }))),
        Err(_) => Ok(Json(json!({ "active": false }))),
    }
}

/// Basic callers are either the resource server configured for the unit
/// or an app cell presenting `client_id:assertion`.
async fn basic_caller_allowed(
    state: &AppState,
    cell: &crate::registry::Cell,
    value: &str,
) -> Result<bool, ApiError> {
    if let (Some(expected_user), Some(expected_password)) = (
        state.config.introspect_username.as_deref(),
        state.config.introspect_password.as_deref(),
    ) {
        if let Some((user, password)) = super::decode_basic_client(value) {
            if user == expected_user && password == expected_password {
                return Ok(true);
            }
        }
    }
    let Some((client_id, assertion)) = super::decode_basic_client(value) else {
        return Ok(false);
    };
    match client_auth(state, cell, Some(&client_id), Some(&assertion), None).await {
        Ok(Some(_)) => Ok(true),
        Ok(None) => Ok(false),
        Err(err) => {
            tracing::debug!(error = %err.description, "introspection client auth failed");
            Ok(false)
        }
    }
}
