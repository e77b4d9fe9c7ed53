//! Token data model.
//!
//! Every token a cell mints is one of exactly four kinds. Local kinds are
//! sealed symmetrically and only ever honored by the cell that minted them;
//! trans-cell kinds are signed JWS structures a foreign cell can verify
//! through the certificate chain in [`trust`].

pub mod codec;
pub mod trust;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default and maximum lifetime of an access token, in seconds.
pub const ACCESS_TOKEN_SECS: i64 = 3_600;
/// Default and maximum lifetime of a refresh token, in seconds.
pub const REFRESH_TOKEN_SECS: i64 = 86_400;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token parse failed: {0}")]
    Parse(String),
    #[error("token expired")]
    Expired,
}

/// The closed set of token kinds. Wire prefixes dispatch decoding before
/// any cryptography runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    LocalAccess,
    LocalRefresh,
    TransCellAccess,
    TransCellRefresh,
}

impl TokenKind {
    pub fn wire_prefix(self) -> &'static str {
        match self {
            TokenKind::LocalAccess => "LA~",
            TokenKind::LocalRefresh => "LR~",
            TokenKind::TransCellAccess => "TA~",
            TokenKind::TransCellRefresh => "TR~",
        }
    }

    pub fn from_wire_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "LA~" => Some(TokenKind::LocalAccess),
            "LR~" => Some(TokenKind::LocalRefresh),
            "TA~" => Some(TokenKind::TransCellAccess),
            "TR~" => Some(TokenKind::TransCellRefresh),
            _ => None,
        }
    }

    /// Short tag embedded in the sealed/signed claims so a token cannot be
    /// replayed under a different prefix.
    pub fn tag(self) -> &'static str {
        match self {
            TokenKind::LocalAccess => "LA",
            TokenKind::LocalRefresh => "LR",
            TokenKind::TransCellAccess => "TA",
            TokenKind::TransCellRefresh => "TR",
        }
    }

    pub fn is_refresh(self) -> bool {
        matches!(self, TokenKind::LocalRefresh | TokenKind::TransCellRefresh)
    }

    pub fn is_trans_cell(self) -> bool {
        matches!(
            self,
            TokenKind::TransCellAccess | TokenKind::TransCellRefresh
        )
    }
}

/// A role carried inside a token, by value. `box_name` scopes the role to a
/// box; a bare role belongs to the cell itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_name: Option<String>,
}

impl RoleRef {
    pub fn cell_level(name: &str) -> Self {
        RoleRef {
            name: name.to_string(),
            box_name: None,
        }
    }

    pub fn qualified(&self) -> String {
        match &self.box_name {
            Some(b) => format!("{b}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// The claims a token carries, independent of its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellToken {
    pub kind: TokenKind,
    /// Principal the token speaks for. Plain account name for resident
    /// local tokens, `https://cell/#account` form everywhere else.
    pub subject: String,
    /// URL of the cell that minted the token.
    pub issuer: String,
    /// App cell URL the subject authenticated through, if any.
    pub schema: Option<String>,
    pub roles: Vec<RoleRef>,
    pub issued_at: i64,
    pub expires_at: i64,
    /// Target cell URL. Trans-cell kinds only.
    pub audience: Option<String>,
}

impl CellToken {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TokenKind,
        subject: &str,
        issuer: &str,
        schema: Option<String>,
        roles: Vec<RoleRef>,
        issued_at: i64,
        lifetime_secs: i64,
        audience: Option<String>,
    ) -> Self {
        CellToken {
            kind,
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            schema,
            roles,
            issued_at,
            expires_at: issued_at + lifetime_secs,
            audience,
        }
    }

    /// Remaining whole seconds of validity at `now`. Never negative.
    pub fn expires_in(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }

    /// Expiry is inclusive: a token presented at exactly `expires_at` is
    /// still valid.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Mint a fresh access token from a validated refresh token, without
    /// re-parsing anything. A `target` turns the result into a
    /// TransCellAccess token aimed at that cell; otherwise the result is a
    /// LocalAccess token for the issuer.
    pub fn refresh_access_token(
        &self,
        issued_at: i64,
        lifetime_secs: i64,
        issuer: &str,
        target: Option<&str>,
        roles: Vec<RoleRef>,
        schema: Option<String>,
    ) -> Result<CellToken, TokenError> {
        if !self.kind.is_refresh() {
            return Err(TokenError::Parse(
                "refresh operations require a refresh token".into(),
            ));
        }
        let (kind, subject) = match target {
            Some(_) => (
                TokenKind::TransCellAccess,
                qualify_subject(&self.subject, issuer),
            ),
            None => (TokenKind::LocalAccess, self.subject.clone()),
        };
        Ok(CellToken::new(
            kind,
            &subject,
            issuer,
            schema,
            roles,
            issued_at,
            lifetime_secs,
            target.map(str::to_string),
        ))
    }

    /// Rotate the refresh token itself: same kind, subject, audience and
    /// schema, issuance advanced to `issued_at`.
    pub fn refresh_refresh_token(
        &self,
        issued_at: i64,
        lifetime_secs: i64,
    ) -> Result<CellToken, TokenError> {
        if !self.kind.is_refresh() {
            return Err(TokenError::Parse(
                "refresh operations require a refresh token".into(),
            ));
        }
        Ok(CellToken::new(
            self.kind,
            &self.subject,
            &self.issuer,
            self.schema.clone(),
            self.roles.clone(),
            issued_at,
            lifetime_secs,
            self.audience.clone(),
        ))
    }
}

/// A bare account name becomes `issuer#name` when it crosses a cell
/// boundary. Subjects already in URL form pass through untouched.
pub fn qualify_subject(subject: &str, issuer: &str) -> String {
    if subject.contains("://") {
        subject.to_string()
    } else {
        format!("{issuer}#{subject}")
    }
}
