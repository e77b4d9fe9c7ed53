//! Token endpoint: `POST /{cell}/__token`.
//!
//! Three grant types. Password authenticates a cell account (lockout is
//! consulted before the password, so a locked account gives nothing away
//! about whether the credentials were right). Refresh rotates a pair
//! without touching credentials. The SAML2-bearer assertion grant trades
//! a trans-cell token issued elsewhere for a pair local to this cell.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::decode_basic_client;
use super::error::ApiError;
use crate::app::AppState;
use crate::auth::AuthScheme;
use crate::config::ensure_trailing_slash;
use crate::registry::Cell;
use crate::token::{
    qualify_subject, CellToken, TokenError, TokenKind, ACCESS_TOKEN_SECS, REFRESH_TOKEN_SECS,
};

pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_REFRESH: &str = "refresh_token";
pub const GRANT_SAML2: &str = "urn:ietf:params:oauth:grant-type:saml2-bearer";

/// Role marking an app cell's client as confidential.
const CONFIDENTIAL_CLIENT_ROLE: &str = "confidentialClient";

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
    pub assertion: Option<String>,
    pub p_target: Option<String>,
    pub p_owner: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_token_expires_in: Option<i64>,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    refresh_token: String,
    refresh_token_expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

pub async fn token(
    State(state): State<AppState>,
    Path(cell_name): Path<String>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Response, ApiError> {
    let cell = state.registry.get_cell(&cell_name).await?;
    let target = validate_target(form.p_target.as_deref())?;
    if form.p_owner.as_deref() == Some("true") {
        return Err(ApiError::invalid_request(
            "owner representation is not supported",
        ));
    }
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let schema = client_auth(
        &state,
        &cell,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
        authorization,
    )
    .await?;
    let access_secs = clamp_lifetime(form.expires_in, ACCESS_TOKEN_SECS)?;
    let refresh_secs = clamp_lifetime(form.refresh_token_expires_in, REFRESH_TOKEN_SECS)?;
    let grant_type = form
        .grant_type
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("grant_type missing"))?;
    let now = Utc::now().timestamp();
    match grant_type {
        GRANT_PASSWORD => {
            password_grant(
                &state, &cell, &form, schema, target, access_secs, refresh_secs, now,
            )
            .await
        }
        GRANT_REFRESH => {
            refresh_grant(
                &state, &cell, &form, schema, target, access_secs, refresh_secs, now,
            )
            .await
        }
        GRANT_SAML2 => {
            assertion_grant(
                &state, &cell, &form, schema, target, access_secs, refresh_secs, now,
            )
            .await
        }
        other => {
            tracing::debug!(cell = %cell.name, grant_type = other, "unsupported grant type");
            Err(ApiError::unsupported_grant_type())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn password_grant(
    state: &AppState,
    cell: &Cell,
    form: &TokenForm,
    schema: Option<String>,
    target: Option<String>,
    access_secs: i64,
    refresh_secs: i64,
    now: i64,
) -> Result<Response, ApiError> {
    let username = form
        .username
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("username missing"))?;
    let password = form
        .password
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("password missing"))?;
    if let Some(account) = state.registry.get_account(&cell.name, username).await? {
        // Lockout comes before the password so a locked account answers
        // identically for right and wrong credentials.
        if state.lockout.is_locked(&account.id, now) {
            state.lockout.record_failure(&account.id, now);
            return Err(ApiError::rate_limited());
        }
        if state
            .registry
            .authenticate(&cell.name, username, password)
            .await?
        {
            state.lockout.reset(&account.id);
            let roles = state.registry.roles_for_account(&cell.name, username).await?;
            let access = match &target {
                Some(t) => CellToken::new(
                    TokenKind::TransCellAccess,
                    &qualify_subject(username, &cell.url),
                    &cell.url,
                    schema.clone(),
                    roles,
                    now,
                    access_secs,
                    Some(t.clone()),
                ),
                None => CellToken::new(
                    TokenKind::LocalAccess,
                    username,
                    &cell.url,
                    schema.clone(),
                    roles,
                    now,
                    access_secs,
                    None,
                ),
            };
            let refresh = CellToken::new(
                TokenKind::LocalRefresh,
                username,
                &cell.url,
                schema,
                Vec::new(),
                now,
                refresh_secs,
                None,
            );
            return respond(state, cell, access, refresh, now).await;
        }
        state.lockout.record_failure(&account.id, now);
    }
    tracing::info!(cell = %cell.name, "password grant refused");
    Err(ApiError::authn_failed())
}

#[allow(clippy::too_many_arguments)]
async fn refresh_grant(
    state: &AppState,
    cell: &Cell,
    form: &TokenForm,
    schema: Option<String>,
    target: Option<String>,
    access_secs: i64,
    refresh_secs: i64,
    now: i64,
) -> Result<Response, ApiError> {
    let raw = form
        .refresh_token
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("refresh_token missing"))?;
    let token = parse_presented(state, cell, raw)?;
    if !token.kind.is_refresh() {
        return Err(ApiError::invalid_grant("not a refresh token"));
    }
    // A schema-bound refresh token only rotates for the client it was
    // issued to.
    if let Some(token_schema) = &token.schema {
        let presented = schema.as_deref().map(|s| s.trim_end_matches("#c"));
        if presented != Some(token_schema.trim_end_matches("#c")) {
            return Err(ApiError::invalid_client(
                "schema does not match the refresh token",
            ));
        }
    }
    let roles = match token.kind {
        TokenKind::LocalRefresh => {
            state
                .registry
                .roles_for_account(&cell.name, &token.subject)
                .await?
        }
        // Visitor refresh tokens re-derive roles from their own claims.
        _ => token.roles.clone(),
    };
    let new_refresh = token.refresh_refresh_token(now, refresh_secs)?;
    let new_access = token.refresh_access_token(
        now,
        access_secs,
        &cell.url,
        target.as_deref(),
        roles,
        token.schema.clone(),
    )?;
    respond(state, cell, new_access, new_refresh, now).await
}

#[allow(clippy::too_many_arguments)]
async fn assertion_grant(
    state: &AppState,
    cell: &Cell,
    form: &TokenForm,
    schema: Option<String>,
    target: Option<String>,
    access_secs: i64,
    refresh_secs: i64,
    now: i64,
) -> Result<Response, ApiError> {
    let raw = form
        .assertion
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("assertion missing"))?;
    let assertion = parse_presented(state, cell, raw)?;
    if assertion.kind != TokenKind::TransCellAccess {
        return Err(ApiError::invalid_grant(
            "assertion must be a trans-cell access token",
        ));
    }
    if assertion.audience.as_deref() != Some(cell.url.as_str()) {
        return Err(ApiError::invalid_grant("token target mismatch"));
    }
    let roles = state.registry.roles_here(&cell.name, &assertion).await?;
    let schema = schema.or_else(|| assertion.schema.clone());
    let access = match &target {
        Some(t) => CellToken::new(
            TokenKind::TransCellAccess,
            &assertion.subject,
            &cell.url,
            schema.clone(),
            roles.clone(),
            now,
            access_secs,
            Some(t.clone()),
        ),
        // Visitor-local access token: roles travel inside it because the
        // subject has no account here to resolve against.
        None => CellToken::new(
            TokenKind::LocalAccess,
            &assertion.subject,
            &cell.url,
            schema.clone(),
            roles.clone(),
            now,
            access_secs,
            None,
        ),
    };
    let refresh = CellToken::new(
        TokenKind::TransCellRefresh,
        &assertion.subject,
        &cell.url,
        schema,
        roles,
        now,
        refresh_secs,
        None,
    );
    respond(state, cell, access, refresh, now).await
}

/// Authenticate the calling client, if it identified itself. The secret
/// is a TransCellAccess token the client's cell issued toward this cell;
/// the authenticated schema is the client cell URL, `#c`-suffixed for
/// confidential clients.
pub(crate) async fn client_auth(
    state: &AppState,
    cell: &Cell,
    client_id: Option<&str>,
    client_secret: Option<&str>,
    authorization: Option<&str>,
) -> Result<Option<String>, ApiError> {
    let (client_id, client_secret) = match authorization.and_then(|h| h.strip_prefix("Basic ")) {
        Some(value) => {
            let (id, secret) = decode_basic_client(value.trim())
                .ok_or_else(|| ApiError::invalid_client("malformed Basic client credentials"))?;
            (Some(id), Some(secret))
        }
        None => (
            client_id.map(str::to_string),
            client_secret.map(str::to_string),
        ),
    };
    let Some(client_id) = client_id else {
        return Ok(None);
    };
    let Some(secret) = client_secret else {
        return Err(ApiError::invalid_client("client_secret missing"));
    };
    let token = match state.codec.parse(&secret, &cell.url, &state.config.unit_url) {
        Ok(token) => token,
        Err(TokenError::Expired) => {
            return Err(ApiError::invalid_client("client secret expired"));
        }
        Err(TokenError::Parse(message)) => {
            return Err(ApiError::invalid_client(message));
        }
    };
    if token.kind != TokenKind::TransCellAccess {
        return Err(ApiError::invalid_client(
            "client secret must be a trans-cell access token",
        ));
    }
    if token.audience.as_deref() != Some(cell.url.as_str()) {
        return Err(ApiError::invalid_client("client secret target mismatch"));
    }
    let client_url = ensure_trailing_slash(client_id);
    if token.issuer != client_url {
        return Err(ApiError::invalid_client(
            "client_id does not match the token issuer",
        ));
    }
    let confidential = token
        .roles
        .iter()
        .any(|r| r.name == CONFIDENTIAL_CLIENT_ROLE);
    Ok(Some(if confidential {
        format!("{client_url}#c")
    } else {
        client_url
    }))
}

fn parse_presented(state: &AppState, cell: &Cell, raw: &str) -> Result<CellToken, ApiError> {
    match state.codec.parse(raw, &cell.url, &state.config.unit_url) {
        Ok(token) => Ok(token),
        Err(TokenError::Expired) => {
            let realm = format!("{}__token", cell.url);
            Err(ApiError::token_expired(&realm, &[AuthScheme::Bearer]))
        }
        Err(err) => Err(err.into()),
    }
}

async fn respond(
    state: &AppState,
    cell: &Cell,
    access: CellToken,
    refresh: CellToken,
    now: i64,
) -> Result<Response, ApiError> {
    let (access_str, refresh_str) = if access.kind.is_trans_cell() || refresh.kind.is_trans_cell()
    {
        let keys = state.keys.current_key_pair(&cell.name).await?;
        (
            state.codec.serialize_signed(&access, &keys)?,
            state.codec.serialize_signed(&refresh, &keys)?,
        )
    } else {
        (
            state.codec.serialize_local(&access)?,
            state.codec.serialize_local(&refresh)?,
        )
    };
    tracing::info!(
        cell = %cell.name,
        kind = ?access.kind,
        subject = %access.subject,
        "token pair issued"
    );
    Ok(Json(TokenResponse {
        access_token: access_str,
        token_type: "Bearer",
        expires_in: access.expires_in(now),
        refresh_token: refresh_str,
        refresh_token_expires_in: refresh.expires_in(now),
        target: access.audience,
    })
    .into_response())
}

/// `p_target` must be an absolute http(s) URL with no whitespace or
/// control characters; it is normalized with a trailing slash.
pub(crate) fn validate_target(target: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(target) = target else {
        return Ok(None);
    };
    let absolute = target.starts_with("http://") || target.starts_with("https://");
    let clean = !target.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control());
    if !absolute || !clean {
        return Err(ApiError::invalid_request(
            "p_target must be an absolute http(s) URL",
        ));
    }
    Ok(Some(ensure_trailing_slash(target)))
}

fn clamp_lifetime(requested: Option<i64>, max: i64) -> Result<i64, ApiError> {
    match requested {
        None => Ok(max),
        Some(v) if v > 0 && v <= max => Ok(v),
        Some(_) => Err(ApiError::invalid_request(
            "requested token lifetime out of range",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_validation_normalizes_and_rejects() {
        assert_eq!(validate_target(None).expect("none"), None);
        assert_eq!(
            validate_target(Some("https://cell-b.example")).expect("ok"),
            Some("https://cell-b.example/".into())
        );
        assert_eq!(
            validate_target(Some("https://cell-b.example/")).expect("ok"),
            Some("https://cell-b.example/".into())
        );
        for bad in [
            "cell-b.example",
            "ftp://cell-b.example/",
            "https://cell-b.example/\r\nx",
            "https://cell b.example/",
        ] {
            assert!(validate_target(Some(bad)).is_err(), "{bad}");
        }
    }

    #[test]
    fn lifetimes_clamp_to_their_maximum() {
        assert_eq!(clamp_lifetime(None, 3600).expect("default"), 3600);
        assert_eq!(clamp_lifetime(Some(60), 3600).expect("ok"), 60);
        assert_eq!(clamp_lifetime(Some(3600), 3600).expect("max"), 3600);
        assert!(clamp_lifetime(Some(0), 3600).is_err());
        assert!(clamp_lifetime(Some(-5), 3600).is_err());
        assert!(clamp_lifetime(Some(3601), 3600).is_err());
    }
}
