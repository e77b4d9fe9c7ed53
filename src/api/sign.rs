//! Sign endpoint: `POST /{cell}/__sign`.
//!
//! Produces a detached JWS (`b64: false`, RFC 7797) over the raw request
//! body. The body streams through SHA-256 chunk by chunk, so memory use
//! is flat no matter how large the payload; only the final digest is
//! signed with the cell's private key.

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::StreamExt;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("payload is required")]
    MissingInput,
    #[error("signing failed: {0}")]
    Key(String),
}

/// Incremental detached-JWS builder. The signing input is
/// `ASCII(protected-header) || '.' || payload-bytes`.
pub struct DetachedSigner {
    header_b64: String,
    hasher: Sha256,
}

impl DetachedSigner {
    pub fn new(key_id: &Uuid) -> Self {
        let header = json!({
            "alg": "RS256",
            "kid": key_id.to_string(),
            "b64": false,
            "crit": ["b64"],
        });
        let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
        let mut hasher = Sha256::new();
        hasher.update(header_b64.as_bytes());
        hasher.update(b".");
        DetachedSigner { header_b64, hasher }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Sign the accumulated digest and emit the compact serialization
    /// with an empty payload segment: `header..signature`.
    pub fn finish(self, key: &RsaPrivateKey) -> Result<String, SignError> {
        let digest = self.hasher.finalize();
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| SignError::Key(e.to_string()))?;
        Ok(format!(
            "{}..{}",
            self.header_b64,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

/// One-shot variant. `None` is the caller's way of saying there was no
/// payload at all, which is an argument error; an empty payload is fine.
pub fn sign_payload(
    key_id: &Uuid,
    key: &RsaPrivateKey,
    payload: Option<&[u8]>,
) -> Result<String, SignError> {
    let payload = payload.ok_or(SignError::MissingInput)?;
    let mut signer = DetachedSigner::new(key_id);
    signer.update(payload);
    signer.finish(key)
}

/// Recompute the signing input from the JWS header and the detached
/// payload, and check the signature.
pub fn verify_detached(public: &RsaPublicKey, jws: &str, payload: &[u8]) -> bool {
    let parts: Vec<&str> = jws.split('.').collect();
    if parts.len() != 3 || !parts[1].is_empty() {
        return false;
    }
    let Ok(signature) = URL_SAFE_NO_PAD.decode(parts[2]) else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(parts[0].as_bytes());
    hasher.update(b".");
    hasher.update(payload);
    public
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &hasher.finalize(),
            &signature,
        )
        .is_ok()
}

pub async fn sign(
    State(state): State<AppState>,
    Path(cell_name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let cell = state.registry.get_cell(&cell_name).await?;
    let keys = state.keys.current_key_pair(&cell.name).await?;
    let mut signer = DetachedSigner::new(&keys.key_id);
    let mut stream = request.into_body().into_data_stream();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::invalid_request(format!("body read: {e}")))?;
        total += chunk.len();
        signer.update(&chunk);
    }
    let jws = signer
        .finish(&keys.private_key)
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;
    tracing::debug!(cell = %cell.name, bytes = total, "payload signed");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/jose")],
        jws,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::rsa_key;

    #[test]
    fn empty_payload_signs_and_verifies() {
        let key = rsa_key(0);
        let kid = Uuid::new_v4();
        let jws = sign_payload(&kid, &key, Some(b"")).expect("sign");
        assert!(verify_detached(&key.to_public_key(), &jws, b""));
    }

    #[test]
    fn large_payload_verifies_and_tampering_breaks_it() {
        let key = rsa_key(0);
        let kid = Uuid::new_v4();
        let payload = vec![0xA5u8; 32 * 1024];
        let jws = sign_payload(&kid, &key, Some(&payload)).expect("sign");
        assert!(verify_detached(&key.to_public_key(), &jws, &payload));

        let mut tampered = payload.clone();
        tampered[12_345] ^= 1;
        assert!(!verify_detached(&key.to_public_key(), &jws, &tampered));
        assert!(!verify_detached(&rsa_key(1).to_public_key(), &jws, &payload));
    }

    #[test]
    fn chunked_signing_matches_one_shot() {
        let key = rsa_key(0);
        let kid = Uuid::new_v4();
        let payload = vec![7u8; 10_000];
        let mut signer = DetachedSigner::new(&kid);
        for chunk in payload.chunks(1024) {
            signer.update(chunk);
        }
        let jws = signer.finish(&key).expect("sign");
        assert!(verify_detached(&key.to_public_key(), &jws, &payload));
    }

    #[test]
    fn missing_payload_is_an_argument_error() {
        let key = rsa_key(0);
        let kid = Uuid::new_v4();
        assert!(matches!(
            sign_payload(&kid, &key, None),
            Err(SignError::MissingInput)
        ));
    }

    #[test]
    fn header_declares_detached_encoding() {
        let key = rsa_key(0);
        let kid = Uuid::new_v4();
        let jws = sign_payload(&kid, &key, Some(b"x")).expect("sign");
        let header_b64 = jws.split('.').next().expect("header");
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(header_b64).expect("b64"),
        )
        .expect("json");
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["b64"], false);
        assert_eq!(header["crit"][0], "b64");
        assert_eq!(header["kid"], kid.to_string());
    }
}
