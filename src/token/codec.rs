//! Wire codec.
//!
//! Local kinds seal their claims with AES-256-GCM under the unit-wide
//! secret; the three-byte wire prefix doubles as the AEAD associated data
//! so a sealed payload cannot be replayed under another prefix. Trans-cell
//! kinds are compact RS256 JWS whose `x5c` header carries the issuing
//! cell's certificate chain.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use super::trust::{self, CellCertificate};
use super::{CellToken, RoleRef, TokenError, TokenKind};
use crate::registry::keys::CellKeyPair;

const NONCE_LEN: usize = 12;

/// Claims sealed inside a local token.
#[derive(Serialize, Deserialize)]
struct LocalClaims {
    knd: String,
    iss: String,
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    roles: Vec<RoleRef>,
    iat: i64,
    exp: i64,
}

/// Claims of a trans-cell JWS.
#[derive(Serialize, Deserialize)]
struct TransClaims {
    knd: String,
    iss: String,
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    roles: Vec<RoleRef>,
    iat: i64,
    exp: i64,
}

pub struct TokenCodec {
    secret: [u8; 32],
    root_public: RsaPublicKey,
}

impl TokenCodec {
    pub fn new(secret: [u8; 32], root_public: RsaPublicKey) -> Self {
        TokenCodec {
            secret,
            root_public,
        }
    }

    /// Encode a local-kind token. Trans-cell kinds need a signing key,
    /// see [`serialize_signed`](Self::serialize_signed).
    pub fn serialize_local(&self, token: &CellToken) -> Result<String, TokenError> {
        if token.kind.is_trans_cell() {
            return Err(TokenError::Parse(
                "trans-cell tokens require a signing key".into(),
            ));
        }
        let claims = LocalClaims {
            knd: token.kind.tag().to_string(),
            iss: token.issuer.clone(),
            sub: token.subject.clone(),
            schema: token.schema.clone(),
            roles: token.roles.clone(),
            iat: token.issued_at,
            exp: token.expires_at,
        };
        let plaintext =
            serde_json::to_vec(&claims).map_err(|e| TokenError::Parse(e.to_string()))?;
        let prefix = token.kind.wire_prefix();
        let cipher = Aes256Gcm::new((&self.secret).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: prefix.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Parse("token sealing failed".into()))?;
        let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);
        Ok(format!("{prefix}{}", URL_SAFE_NO_PAD.encode(wire)))
    }

    /// Encode a trans-cell token as an RS256 JWS carrying the signer's
    /// certificate chain.
    pub fn serialize_signed(
        &self,
        token: &CellToken,
        signer: &CellKeyPair,
    ) -> Result<String, TokenError> {
        if !token.kind.is_trans_cell() {
            return self.serialize_local(token);
        }
        let claims = TransClaims {
            knd: token.kind.tag().to_string(),
            iss: token.issuer.clone(),
            sub: token.subject.clone(),
            aud: token.audience.clone(),
            schema: token.schema.clone(),
            roles: token.roles.clone(),
            iat: token.issued_at,
            exp: token.expires_at,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signer.key_id.to_string());
        header.x5c = Some(
            signer
                .chain
                .iter()
                .map(CellCertificate::encode)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TokenError::Parse(e.to_string()))?,
        );
        let der = signer
            .private_key
            .to_pkcs1_der()
            .map_err(|e| TokenError::Parse(format!("signing key unusable: {e}")))?;
        let jws = jsonwebtoken::encode(&header, &claims, &EncodingKey::from_rsa_der(der.as_bytes()))
            .map_err(|e| TokenError::Parse(e.to_string()))?;
        Ok(format!("{}{jws}", token.kind.wire_prefix()))
    }

    /// Decode and validate a token presented at `issuer_cell_url` via
    /// `request_host`. Structural and cryptographic failures surface as
    /// [`TokenError::Parse`]; an otherwise valid but stale token surfaces
    /// as [`TokenError::Expired`].
    pub fn parse(
        &self,
        raw: &str,
        issuer_cell_url: &str,
        request_host: &str,
    ) -> Result<CellToken, TokenError> {
        self.parse_at(raw, issuer_cell_url, request_host, Utc::now().timestamp())
    }

    pub fn parse_at(
        &self,
        raw: &str,
        issuer_cell_url: &str,
        request_host: &str,
        now: i64,
    ) -> Result<CellToken, TokenError> {
        let prefix = raw
            .get(..3)
            .ok_or_else(|| TokenError::Parse("token too short".into()))?;
        let kind = TokenKind::from_wire_prefix(prefix)
            .ok_or_else(|| TokenError::Parse(format!("unknown token prefix {prefix:?}")))?;
        let rest = &raw[3..];
        let token = if kind.is_trans_cell() {
            self.parse_trans(rest, kind, issuer_cell_url, request_host, now)?
        } else {
            self.parse_local(rest, kind, issuer_cell_url)?
        };
        if token.is_expired_at(now) {
            return Err(TokenError::Expired);
        }
        Ok(token)
    }

    fn parse_local(
        &self,
        rest: &str,
        kind: TokenKind,
        issuer_cell_url: &str,
    ) -> Result<CellToken, TokenError> {
        let wire = URL_SAFE_NO_PAD
            .decode(rest)
            .map_err(|e| TokenError::Parse(e.to_string()))?;
        if wire.len() <= NONCE_LEN {
            return Err(TokenError::Parse("sealed payload truncated".into()));
        }
        let (nonce, sealed) = wire.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new((&self.secret).into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: kind.wire_prefix().as_bytes(),
                },
            )
            .map_err(|_| TokenError::Parse("token unsealing failed".into()))?;
        let claims: LocalClaims =
            serde_json::from_slice(&plaintext).map_err(|e| TokenError::Parse(e.to_string()))?;
        if claims.knd != kind.tag() {
            return Err(TokenError::Parse("token kind mismatch".into()));
        }
        if claims.iss != issuer_cell_url {
            return Err(TokenError::Parse(
                "local token presented outside its issuer cell".into(),
            ));
        }
        Ok(CellToken {
            kind,
            subject: claims.sub,
            issuer: claims.iss,
            schema: claims.schema,
            roles: claims.roles,
            issued_at: claims.iat,
            expires_at: claims.exp,
            audience: None,
        })
    }

    fn parse_trans(
        &self,
        jws: &str,
        kind: TokenKind,
        issuer_cell_url: &str,
        request_host: &str,
        now: i64,
    ) -> Result<CellToken, TokenError> {
        let header =
            jsonwebtoken::decode_header(jws).map_err(|e| TokenError::Parse(e.to_string()))?;
        let x5c = header
            .x5c
            .ok_or_else(|| TokenError::Parse("missing certificate chain".into()))?;
        let chain = x5c
            .iter()
            .map(|c| CellCertificate::decode(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TokenError::Parse(e.to_string()))?;
        let issuer = unverified_issuer(jws)?;
        trust::verify_chain(&chain, &self.root_public, &issuer, now)
            .map_err(|e| TokenError::Parse(e.to_string()))?;
        // The leaf already carries n/e in the encoding jsonwebtoken wants.
        let leaf_cert = &chain[0];
        let key = DecodingKey::from_rsa_components(&leaf_cert.n, &leaf_cert.e)
            .map_err(|e| TokenError::Parse(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();
        let data = jsonwebtoken::decode::<TransClaims>(jws, &key, &validation)
            .map_err(|e| TokenError::Parse(format!("signature invalid: {e}")))?;
        let claims = data.claims;
        if claims.knd != kind.tag() {
            return Err(TokenError::Parse("token kind mismatch".into()));
        }
        let here = [issuer_cell_url, request_host];
        let accepted = here
            .iter()
            .any(|h| *h == claims.iss || claims.aud.as_deref() == Some(h));
        if !accepted {
            return Err(TokenError::Parse(
                "token audience does not cover this cell".into(),
            ));
        }
        Ok(CellToken {
            kind,
            subject: claims.sub,
            issuer: claims.iss,
            schema: claims.schema,
            roles: claims.roles,
            issued_at: claims.iat,
            expires_at: claims.exp,
            audience: claims.aud,
        })
    }
}

/// Pull `iss` out of an unverified JWS payload; chain verification needs
/// the subject before any signature can be checked.
fn unverified_issuer(jws: &str) -> Result<String, TokenError> {
    let payload = jws
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::Parse("malformed JWS".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenError::Parse(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Parse(e.to_string()))?;
    value
        .get("iss")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TokenError::Parse("missing iss claim".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::keys::CellKeyPair;
    use crate::test_support::rsa_key;
    use crate::token::{ACCESS_TOKEN_SECS, REFRESH_TOKEN_SECS};
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;
    const CELL_A: &str = "https://cell-a.example/";
    const CELL_B: &str = "https://cell-b.example/";
    const CELL_C: &str = "https://cell-c.example/";
    const HOST: &str = "https://unit.example/";

    fn codec() -> TokenCodec {
        TokenCodec::new([7u8; 32], rsa_key(0).to_public_key())
    }

    fn cell_a_keys() -> CellKeyPair {
        let root = rsa_key(0);
        let private = rsa_key(1);
        let cert = CellCertificate::issue(
            CELL_A,
            &private.to_public_key(),
            &root,
            NOW,
            31_536_000,
        )
        .expect("issue cert");
        CellKeyPair {
            key_id: Uuid::new_v4(),
            public_key: private.to_public_key(),
            private_key: private,
            chain: vec![cert],
        }
    }

    fn local_access() -> CellToken {
        CellToken::new(
            TokenKind::LocalAccess,
            "alice",
            CELL_A,
            Some("https://app.example/".into()),
            vec![
                RoleRef::cell_level("reader"),
                RoleRef {
                    name: "editor".into(),
                    box_name: Some("docs".into()),
                },
            ],
            NOW,
            ACCESS_TOKEN_SECS,
            None,
        )
    }

    fn trans_access() -> CellToken {
        CellToken::new(
            TokenKind::TransCellAccess,
            "https://cell-a.example/#alice",
            CELL_A,
            None,
            vec![RoleRef::cell_level("friend")],
            NOW,
            ACCESS_TOKEN_SECS,
            Some(CELL_B.into()),
        )
    }

    #[test]
    fn local_access_round_trips_every_field() {
        let codec = codec();
        let token = local_access();
        let wire = codec.serialize_local(&token).expect("serialize");
        assert!(wire.starts_with("LA~"));
        let parsed = codec.parse_at(&wire, CELL_A, HOST, NOW).expect("parse");
        assert_eq!(parsed, token);
    }

    #[test]
    fn local_refresh_round_trips() {
        let codec = codec();
        let token = CellToken::new(
            TokenKind::LocalRefresh,
            "alice",
            CELL_A,
            None,
            vec![],
            NOW,
            REFRESH_TOKEN_SECS,
            None,
        );
        let wire = codec.serialize_local(&token).expect("serialize");
        assert!(wire.starts_with("LR~"));
        let parsed = codec.parse_at(&wire, CELL_A, HOST, NOW).expect("parse");
        assert_eq!(parsed, token);
    }

    #[test]
    fn prefix_swap_fails_to_unseal() {
        let codec = codec();
        let wire = codec.serialize_local(&local_access()).expect("serialize");
        let forged = format!("LR~{}", &wire[3..]);
        let err = codec
            .parse_at(&forged, CELL_A, HOST, NOW)
            .expect_err("must fail");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn local_token_rejected_outside_its_issuer() {
        let codec = codec();
        let wire = codec.serialize_local(&local_access()).expect("serialize");
        let err = codec
            .parse_at(&wire, CELL_B, HOST, NOW)
            .expect_err("must fail");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn expiry_boundary_is_inclusive_on_parse() {
        let codec = codec();
        let token = local_access();
        let wire = codec.serialize_local(&token).expect("serialize");
        codec
            .parse_at(&wire, CELL_A, HOST, token.expires_at)
            .expect("boundary still valid");
        let err = codec
            .parse_at(&wire, CELL_A, HOST, token.expires_at + 1)
            .expect_err("past boundary");
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn trans_access_round_trips_at_its_audience() {
        let codec = codec();
        let keys = cell_a_keys();
        let token = trans_access();
        let wire = codec.serialize_signed(&token, &keys).expect("serialize");
        assert!(wire.starts_with("TA~"));
        let parsed = codec.parse_at(&wire, CELL_B, HOST, NOW).expect("parse");
        assert_eq!(parsed, token);
    }

    #[test]
    fn trans_access_also_valid_at_its_issuer() {
        let codec = codec();
        let keys = cell_a_keys();
        let wire = codec
            .serialize_signed(&trans_access(), &keys)
            .expect("serialize");
        codec.parse_at(&wire, CELL_A, HOST, NOW).expect("parse");
    }

    #[test]
    fn trans_access_rejected_at_unrelated_cell() {
        let codec = codec();
        let keys = cell_a_keys();
        let wire = codec
            .serialize_signed(&trans_access(), &keys)
            .expect("serialize");
        let err = codec
            .parse_at(&wire, CELL_C, CELL_C, NOW)
            .expect_err("must fail");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn trans_refresh_round_trips() {
        let codec = codec();
        let keys = cell_a_keys();
        let token = CellToken::new(
            TokenKind::TransCellRefresh,
            "https://cell-b.example/#bob",
            CELL_A,
            None,
            vec![RoleRef::cell_level("friend")],
            NOW,
            REFRESH_TOKEN_SECS,
            None,
        );
        let wire = codec.serialize_signed(&token, &keys).expect("serialize");
        assert!(wire.starts_with("TR~"));
        let parsed = codec.parse_at(&wire, CELL_A, HOST, NOW).expect("parse");
        assert_eq!(parsed, token);
    }

    #[test]
    fn trans_prefix_swap_is_rejected() {
        let codec = codec();
        let keys = cell_a_keys();
        let wire = codec
            .serialize_signed(&trans_access(), &keys)
            .expect("serialize");
        let forged = format!("TR~{}", &wire[3..]);
        let err = codec
            .parse_at(&forged, CELL_B, HOST, NOW)
            .expect_err("must fail");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn chain_signed_by_unknown_root_is_rejected() {
        let codec = codec();
        let rogue_root = rsa_key(2);
        let private = rsa_key(1);
        let cert = CellCertificate::issue(
            CELL_A,
            &private.to_public_key(),
            &rogue_root,
            NOW,
            31_536_000,
        )
        .expect("issue cert");
        let keys = CellKeyPair {
            key_id: Uuid::new_v4(),
            public_key: private.to_public_key(),
            private_key: private,
            chain: vec![cert],
        };
        let wire = codec
            .serialize_signed(&trans_access(), &keys)
            .expect("serialize");
        let err = codec
            .parse_at(&wire, CELL_B, HOST, NOW)
            .expect_err("must fail");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let codec = codec();
        for raw in ["", "LA", "ZZ~abcdef", "LA~!!!not-base64!!!", "TA~x.y"] {
            let err = codec.parse_at(raw, CELL_A, HOST, NOW).expect_err(raw);
            assert!(matches!(err, TokenError::Parse(_)), "{raw}");
        }
    }
}
