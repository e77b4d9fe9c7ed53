//! Authorization endpoint: `GET /{cell}/__authz`.
//!
//! Implicit grant only. The resource owner authenticates with Basic
//! credentials; the outcome always travels back to `redirect_uri` in a
//! 303 fragment, success and failure alike. Requests that leave us
//! nowhere safe to redirect to (no `redirect_uri`, no `client_id`, or a
//! malformed URL) fail with a plain 400 instead.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;

use super::error::ApiError;
use crate::app::AppState;
use crate::auth::access_context::{AccessContext, AccessType, InvalidReason, ResolverDeps};
use crate::config::ensure_trailing_slash;
use crate::registry::Cell;
use crate::token::{CellToken, TokenKind, ACCESS_TOKEN_SECS};

#[derive(Debug, Deserialize)]
pub struct AuthzQuery {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
}

pub async fn authz(
    State(state): State<AppState>,
    Path(cell_name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthzQuery>,
) -> Result<Response, ApiError> {
    let cell = state.registry.get_cell(&cell_name).await?;
    let redirect_uri = query
        .redirect_uri
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("redirect_uri missing"))?;
    let client_id = query
        .client_id
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("client_id missing"))?;
    let valid_redirect = (redirect_uri.starts_with("http://")
        || redirect_uri.starts_with("https://"))
        && !redirect_uri
            .chars()
            .any(|c| c.is_ascii_whitespace() || c.is_ascii_control());
    if !valid_redirect {
        return Err(ApiError::invalid_request(
            "redirect_uri must be an absolute http(s) URL",
        ));
    }

    if query.response_type.as_deref() != Some("token") {
        return Ok(error_redirect(
            redirect_uri,
            "unsupported_response_type",
            "only the implicit grant is supported",
            query.state.as_deref(),
        ));
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let deps = ResolverDeps {
        config: &state.config,
        codec: &state.codec,
        registry: state.registry.as_ref(),
        lockout: &state.lockout,
    };
    let ctx = AccessContext::resolve(authorization, &cell, &state.config.unit_url, deps).await?;
    match ctx.access_type() {
        AccessType::Basic => {
            issue_redirect(&state, &cell, &ctx, client_id, redirect_uri, query.state.as_deref())
        }
        AccessType::Invalid if ctx.invalid_reason() == Some(InvalidReason::BasicLocked) => {
            Ok(error_redirect(
                redirect_uri,
                "access_denied",
                "account temporarily locked",
                query.state.as_deref(),
            ))
        }
        _ => Ok(error_redirect(
            redirect_uri,
            "access_denied",
            "resource owner authentication failed",
            query.state.as_deref(),
        )),
    }
}

fn issue_redirect(
    state: &AppState,
    cell: &Cell,
    ctx: &AccessContext,
    client_id: &str,
    redirect_uri: &str,
    client_state: Option<&str>,
) -> Result<Response, ApiError> {
    let subject = ctx
        .subject()
        .and_then(|s| s.rsplit_once('#').map(|(_, name)| name.to_string()))
        .ok_or_else(|| ApiError::invalid_request("no authenticated subject"))?;
    let now = Utc::now().timestamp();
    let token = CellToken::new(
        TokenKind::LocalAccess,
        &subject,
        &cell.url,
        Some(ensure_trailing_slash(client_id)),
        ctx.roles().to_vec(),
        now,
        ACCESS_TOKEN_SECS,
        None,
    );
    let wire = state.codec.serialize_local(&token)?;
    let mut fragment = format!(
        "access_token={}&token_type=Bearer&expires_in={}",
        fragment_escape(&wire),
        token.expires_in(now)
    );
    if let Some(s) = client_state {
        fragment.push_str(&format!("&state={}", fragment_escape(s)));
    }
    tracing::info!(cell = %cell.name, %subject, "authorization granted");
    Ok(redirect_303(format!("{redirect_uri}#{fragment}")))
}

fn error_redirect(
    redirect_uri: &str,
    error: &str,
    description: &str,
    client_state: Option<&str>,
) -> Response {
    let mut fragment = format!(
        "error={}&error_description={}",
        fragment_escape(error),
        fragment_escape(description)
    );
    if let Some(s) = client_state {
        fragment.push_str(&format!("&state={}", fragment_escape(s)));
    }
    redirect_303(format!("{redirect_uri}#{fragment}"))
}

fn redirect_303(location: String) -> Response {
    (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response()
}

/// The classifier callers and tests use: an authorization response
/// succeeded iff it is a 303 whose Location fragment exists and carries
/// no `error` key. Other keys, `error_description` included, do not make
/// a response a failure on their own.
pub fn is_success_authorization(status: StatusCode, location: Option<&str>) -> bool {
    if status != StatusCode::SEE_OTHER {
        return false;
    }
    let Some(location) = location else {
        return false;
    };
    let Some((_, fragment)) = location.split_once('#') else {
        return false;
    };
    !fragment.split('&').any(|pair| {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        key == "error"
    })
}

/// Percent-encode a fragment parameter value. Unreserved characters pass
/// through, everything else is escaped byte-wise.
fn fragment_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_with_token_is_success() {
        assert!(is_success_authorization(
            StatusCode::SEE_OTHER,
            Some("https://app.example/cb#access_token=LA~abc&token_type=Bearer")
        ));
    }

    #[test]
    fn fragment_with_error_key_is_failure() {
        assert!(!is_success_authorization(
            StatusCode::SEE_OTHER,
            Some("https://app.example/cb#error=access_denied&error_description=no&state=s")
        ));
    }

    #[test]
    fn suspicious_keys_without_error_are_still_success() {
        assert!(is_success_authorization(
            StatusCode::SEE_OTHER,
            Some("https://app.example/cb#error_description=odd&state=s&code=c")
        ));
    }

    #[test]
    fn missing_fragment_or_wrong_status_is_failure() {
        assert!(!is_success_authorization(
            StatusCode::SEE_OTHER,
            Some("https://app.example/cb")
        ));
        assert!(!is_success_authorization(StatusCode::SEE_OTHER, None));
        assert!(!is_success_authorization(
            StatusCode::FOUND,
            Some("https://app.example/cb#access_token=LA~abc")
        ));
    }

    #[test]
    fn escaping_covers_separator_bytes() {
        assert_eq!(fragment_escape("a b&c=d#e"), "a%20b%26c%3Dd%23e");
        assert_eq!(fragment_escape("LA~x"), "LA~x");
    }
}
