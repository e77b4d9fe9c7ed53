//! Per-request access context.
//!
//! Resolution is lazy about failure: a bad header never aborts the
//! request by itself, it produces an `Invalid` context carrying the
//! reason. The resource decides later, through [`AccessContext::
//! require_valid`], whether and how to reject.

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use chrono::Utc;

use super::lockout::LockoutCounter;
use super::{AuthError, AuthScheme};
use crate::config::UnitConfig;
use crate::registry::{Cell, CellRegistry, RegistryError};
use crate::token::codec::TokenCodec;
use crate::token::{RoleRef, TokenError, TokenKind};

/// Role name that promotes a unit-user token to unit master.
const UNIT_ADMIN_ROLE: &str = "unitAdmin";
/// The schema-less box every cell owns.
pub const MAIN_BOX: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// No Authorization header at all.
    Anonymous,
    /// A header was present but could not be honored.
    Invalid,
    /// Basic credentials against a cell account.
    Basic,
    /// Bearer local access token, subject is one of this cell's accounts.
    Resident,
    /// Bearer token for a subject of a foreign cell.
    Visitor,
    /// Trans-cell token addressed to the unit itself.
    UnitUser,
    /// The unit master token or a unit-admin unit-user token.
    UnitMaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    TokenParse,
    Expired,
    UnsupportedScheme,
    BasicFormat,
    BasicFailed,
    BasicLocked,
    BasicNotAllowed,
    RefreshTokenUsed,
}

/// Read-only collaborators [`AccessContext::resolve`] needs.
pub struct ResolverDeps<'a> {
    pub config: &'a UnitConfig,
    pub codec: &'a TokenCodec,
    pub registry: &'a dyn CellRegistry,
    pub lockout: &'a LockoutCounter,
}

#[derive(Debug, Clone)]
pub struct AccessContext {
    access_type: AccessType,
    subject: Option<String>,
    schema: Option<String>,
    roles: Vec<RoleRef>,
    realm: String,
    invalid_reason: Option<InvalidReason>,
}

impl AccessContext {
    fn anonymous(realm: String) -> Self {
        AccessContext {
            access_type: AccessType::Anonymous,
            subject: None,
            schema: None,
            roles: Vec::new(),
            realm,
            invalid_reason: None,
        }
    }

    fn invalid(realm: String, reason: InvalidReason) -> Self {
        AccessContext {
            access_type: AccessType::Invalid,
            subject: None,
            schema: None,
            roles: Vec::new(),
            realm,
            invalid_reason: Some(reason),
        }
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn roles(&self) -> &[RoleRef] {
        &self.roles
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn invalid_reason(&self) -> Option<InvalidReason> {
        self.invalid_reason
    }

    pub fn is_unit_user_token(&self) -> bool {
        matches!(
            self.access_type,
            AccessType::UnitUser | AccessType::UnitMaster
        )
    }

    /// Classify the Authorization header of a request aimed at `cell`.
    /// Only registry outages propagate as errors.
    pub async fn resolve(
        authorization: Option<&str>,
        cell: &Cell,
        request_host: &str,
        deps: ResolverDeps<'_>,
    ) -> Result<AccessContext, RegistryError> {
        let realm = format!("{}__token", cell.url);
        let Some(header) = authorization else {
            return Ok(AccessContext::anonymous(realm));
        };
        let Some((scheme, value)) = header.split_once(' ') else {
            return Ok(AccessContext::invalid(realm, InvalidReason::UnsupportedScheme));
        };
        match scheme {
            "Basic" => Self::resolve_basic(value.trim(), cell, realm, &deps).await,
            "Bearer" => Self::resolve_bearer(value.trim(), cell, request_host, realm, &deps).await,
            _ => Ok(AccessContext::invalid(realm, InvalidReason::UnsupportedScheme)),
        }
    }

    async fn resolve_basic(
        value: &str,
        cell: &Cell,
        realm: String,
        deps: &ResolverDeps<'_>,
    ) -> Result<AccessContext, RegistryError> {
        let Some((username, password)) = decode_basic(value) else {
            return Ok(AccessContext::invalid(realm, InvalidReason::BasicFormat));
        };
        let Some(account) = deps.registry.get_account(&cell.name, &username).await? else {
            tracing::debug!(cell = %cell.name, "basic auth against unknown account");
            return Ok(AccessContext::invalid(realm, InvalidReason::BasicFailed));
        };
        let now = Utc::now().timestamp();
        if deps.lockout.is_locked(&account.id, now) {
            deps.lockout.record_failure(&account.id, now);
            return Ok(AccessContext::invalid(realm, InvalidReason::BasicLocked));
        }
        if !deps
            .registry
            .authenticate(&cell.name, &username, &password)
            .await?
        {
            deps.lockout.record_failure(&account.id, now);
            return Ok(AccessContext::invalid(realm, InvalidReason::BasicFailed));
        }
        deps.lockout.reset(&account.id);
        let roles = deps.registry.roles_for_account(&cell.name, &username).await?;
        Ok(AccessContext {
            access_type: AccessType::Basic,
            subject: Some(format!("{}#{}", cell.url, username)),
            schema: None,
            roles,
            realm,
            invalid_reason: None,
        })
    }

    async fn resolve_bearer(
        value: &str,
        cell: &Cell,
        request_host: &str,
        realm: String,
        deps: &ResolverDeps<'_>,
    ) -> Result<AccessContext, RegistryError> {
        if let Some(master) = &deps.config.master_token {
            if value == master {
                return Ok(AccessContext {
                    access_type: AccessType::UnitMaster,
                    subject: None,
                    schema: None,
                    roles: Vec::new(),
                    realm,
                    invalid_reason: None,
                });
            }
        }
        let token = match deps.codec.parse(value, &cell.url, request_host) {
            Ok(token) => token,
            Err(TokenError::Expired) => {
                return Ok(AccessContext::invalid(realm, InvalidReason::Expired));
            }
            Err(TokenError::Parse(message)) => {
                tracing::debug!(cell = %cell.name, %message, "bearer token rejected");
                return Ok(AccessContext::invalid(realm, InvalidReason::TokenParse));
            }
        };
        if token.kind.is_refresh() {
            return Ok(AccessContext::invalid(realm, InvalidReason::RefreshTokenUsed));
        }
        match token.kind {
            TokenKind::LocalAccess => {
                if token.subject.contains("://") {
                    // Visitor-local token minted by the assertion grant;
                    // its roles were resolved when it was issued.
                    Ok(AccessContext {
                        access_type: AccessType::Visitor,
                        subject: Some(token.subject.clone()),
                        schema: token.schema.clone(),
                        roles: token.roles,
                        realm,
                        invalid_reason: None,
                    })
                } else {
                    let roles = deps
                        .registry
                        .roles_for_account(&cell.name, &token.subject)
                        .await?;
                    Ok(AccessContext {
                        access_type: AccessType::Resident,
                        subject: Some(format!("{}#{}", cell.url, token.subject)),
                        schema: token.schema.clone(),
                        roles,
                        realm,
                        invalid_reason: None,
                    })
                }
            }
            TokenKind::TransCellAccess => {
                let unit_addressed = token.audience.as_deref() == Some(deps.config.unit_url.as_str())
                    && deps
                        .config
                        .unit_user_issuers
                        .iter()
                        .any(|issuer| *issuer == token.issuer);
                if unit_addressed {
                    let access_type = if token.roles.iter().any(|r| r.name == UNIT_ADMIN_ROLE) {
                        AccessType::UnitMaster
                    } else {
                        AccessType::UnitUser
                    };
                    return Ok(AccessContext {
                        access_type,
                        subject: Some(token.subject.clone()),
                        schema: token.schema.clone(),
                        roles: token.roles,
                        realm,
                        invalid_reason: None,
                    });
                }
                let roles = deps.registry.roles_here(&cell.name, &token).await?;
                Ok(AccessContext {
                    access_type: AccessType::Visitor,
                    subject: Some(token.subject.clone()),
                    schema: token.schema.clone(),
                    roles,
                    realm,
                    invalid_reason: None,
                })
            }
            TokenKind::LocalRefresh | TokenKind::TransCellRefresh => unreachable!(),
        }
    }

    /// Reject anonymous or invalid access with the error the reason calls
    /// for, advertising `schemes` in the challenge.
    pub fn require_valid(&self, schemes: &[AuthScheme]) -> Result<(), AuthError> {
        match self.access_type {
            AccessType::Anonymous => Err(AuthError::AuthorizationRequired {
                realm: self.realm.clone(),
                schemes: schemes.to_vec(),
            }),
            AccessType::Invalid => match self.invalid_reason {
                Some(InvalidReason::Expired) => Err(AuthError::TokenExpired {
                    realm: self.realm.clone(),
                    schemes: schemes.to_vec(),
                }),
                Some(InvalidReason::BasicLocked) => Err(AuthError::RateLimited),
                Some(InvalidReason::BasicFailed) | Some(InvalidReason::BasicFormat) => {
                    Err(AuthError::AuthenticationFailed {
                        realm: self.realm.clone(),
                    })
                }
                Some(InvalidReason::BasicNotAllowed) => Err(AuthError::AuthenticationFailed {
                    realm: self.realm.clone(),
                }),
                reason => Err(AuthError::TokenInvalid {
                    realm: self.realm.clone(),
                    schemes: schemes.to_vec(),
                    message: format!("{reason:?}"),
                }),
            },
            _ => Ok(()),
        }
    }

    /// Basic authentication does not reach into boxes that carry an app
    /// schema; crossing into one silently demotes the context to invalid.
    pub fn update_basic_authentication_state_for_resource(
        &mut self,
        box_schema: Option<&str>,
        box_name: &str,
    ) {
        if self.access_type != AccessType::Basic {
            return;
        }
        if box_schema.is_some() && box_name != MAIN_BOX {
            self.access_type = AccessType::Invalid;
            self.invalid_reason = Some(InvalidReason::BasicNotAllowed);
            self.subject = None;
            self.roles.clear();
        }
    }
}

fn decode_basic(value: &str) -> Option<(String, String)> {
    let decoded = BASE64_STD.decode(value).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), password.to_string()))
}
