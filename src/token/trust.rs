//! Cell certificate chains.
//!
//! A [`CellCertificate`] binds a cell URL to an RSA public key and is
//! signed by its parent key with RSA-PKCS1v15 over SHA-256. Trans-cell
//! tokens carry their chain leaf-first in the JWS `x5c` header, base64url
//! JSON per element; verification walks the chain and anchors the last
//! link in the unit root key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("certificate decode failed: {0}")]
    Decode(String),
    #[error("certificate signature invalid for {0}")]
    Signature(String),
    #[error("certificate expired for {0}")]
    Expired(String),
    #[error("certificate subject mismatch: expected {expected}, found {found}")]
    SubjectMismatch { expected: String, found: String },
    #[error("key material unusable: {0}")]
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCertificate {
    /// Cell URL the key belongs to.
    pub subject: String,
    /// RSA modulus, base64url without padding, big-endian.
    pub n: String,
    /// RSA public exponent, same encoding.
    pub e: String,
    pub issued_at: i64,
    pub expires_at: i64,
    /// Parent signature over [`signing_input`](Self::signing_input).
    pub signature: String,
}

impl CellCertificate {
    pub fn issue(
        subject: &str,
        subject_key: &RsaPublicKey,
        signer: &RsaPrivateKey,
        issued_at: i64,
        lifetime_secs: i64,
    ) -> Result<Self, TrustError> {
        let mut cert = CellCertificate {
            subject: subject.to_string(),
            n: URL_SAFE_NO_PAD.encode(subject_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(subject_key.e().to_bytes_be()),
            issued_at,
            expires_at: issued_at + lifetime_secs,
            signature: String::new(),
        };
        let digest = Sha256::digest(cert.signing_input());
        let sig = signer
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| TrustError::Key(e.to_string()))?;
        cert.signature = URL_SAFE_NO_PAD.encode(sig);
        Ok(cert)
    }

    /// Canonical byte string the parent signs. The signature field itself
    /// is excluded.
    fn signing_input(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.subject, self.n, self.e, self.issued_at, self.expires_at
        )
        .into_bytes()
    }

    pub fn public_key(&self) -> Result<RsaPublicKey, TrustError> {
        let n = URL_SAFE_NO_PAD
            .decode(&self.n)
            .map_err(|e| TrustError::Decode(e.to_string()))?;
        let e = URL_SAFE_NO_PAD
            .decode(&self.e)
            .map_err(|e| TrustError::Decode(e.to_string()))?;
        RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map_err(|e| TrustError::Key(e.to_string()))
    }

    pub fn verify_signed_by(&self, parent: &RsaPublicKey) -> Result<(), TrustError> {
        let sig = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| TrustError::Decode(e.to_string()))?;
        let digest = Sha256::digest(self.signing_input());
        parent
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig)
            .map_err(|_| TrustError::Signature(self.subject.clone()))
    }

    /// Base64url JSON, the form carried in a JWS `x5c` element.
    pub fn encode(&self) -> Result<String, TrustError> {
        let json = serde_json::to_vec(self).map_err(|e| TrustError::Decode(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self, TrustError> {
        let json = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| TrustError::Decode(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| TrustError::Decode(e.to_string()))
    }
}

/// Walk a leaf-first chain: every element must be unexpired and signed by
/// the next element's key, the last by the unit root, and the leaf subject
/// must match `leaf_subject`. Returns the leaf public key on success.
pub fn verify_chain(
    chain: &[CellCertificate],
    root: &RsaPublicKey,
    leaf_subject: &str,
    now: i64,
) -> Result<RsaPublicKey, TrustError> {
    let leaf = chain
        .first()
        .ok_or_else(|| TrustError::Decode("empty certificate chain".into()))?;
    if leaf.subject != leaf_subject {
        return Err(TrustError::SubjectMismatch {
            expected: leaf_subject.to_string(),
            found: leaf.subject.clone(),
        });
    }
    for (i, cert) in chain.iter().enumerate() {
        if now > cert.expires_at {
            return Err(TrustError::Expired(cert.subject.clone()));
        }
        match chain.get(i + 1) {
            Some(parent) => cert.verify_signed_by(&parent.public_key()?)?,
            None => cert.verify_signed_by(root)?,
        }
    }
    leaf.public_key()
}
