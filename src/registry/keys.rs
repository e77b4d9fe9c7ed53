//! Per-cell signing keys.
//!
//! Every cell signs trans-cell tokens with its own RSA pair, anchored in
//! the unit root key through a certificate chain. Rotation swaps the pair
//! under a fresh key id; tokens signed by the old pair simply stop
//! verifying once its certificate is gone from the chain callers see.

use std::collections::HashMap;

use async_trait::async_trait;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RegistryError, RegistryResult};
use crate::token::trust::CellCertificate;

const RSA_BITS: usize = 2048;
/// Cell certificates outlive any token they anchor by a wide margin.
const CELL_CERT_SECS: i64 = 10 * 365 * 24 * 3600;

#[derive(Clone)]
pub struct CellKeyPair {
    pub key_id: Uuid,
    pub public_key: RsaPublicKey,
    pub private_key: RsaPrivateKey,
    /// Leaf-first chain up to (but excluding) the unit root.
    pub chain: Vec<CellCertificate>,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn current_key_pair(&self, cell_name: &str) -> RegistryResult<CellKeyPair>;
}

pub struct UnitKeyStore {
    root_private: RsaPrivateKey,
    root_public: RsaPublicKey,
    pairs: RwLock<HashMap<String, CellKeyPair>>,
}

impl UnitKeyStore {
    pub fn new(root_private: RsaPrivateKey) -> Self {
        let root_public = root_private.to_public_key();
        UnitKeyStore {
            root_private,
            root_public,
            pairs: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a fresh unit root. Key generation blocks; call it at
    /// startup, not per request.
    pub fn generate() -> RegistryResult<Self> {
        let root = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
            .map_err(|e| RegistryError::Unavailable(anyhow::anyhow!("root key generation: {e}")))?;
        Ok(UnitKeyStore::new(root))
    }

    pub fn root_public(&self) -> &RsaPublicKey {
        &self.root_public
    }

    /// Create and store a key pair for a cell, with a root-signed leaf
    /// certificate.
    pub async fn provision(&self, cell_name: &str, cell_url: &str) -> RegistryResult<CellKeyPair> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
            .map_err(|e| RegistryError::Unavailable(anyhow::anyhow!("cell key generation: {e}")))?;
        self.provision_with_key(cell_name, cell_url, private).await
    }

    /// Same as [`provision`](Self::provision) with a caller-supplied key.
    pub async fn provision_with_key(
        &self,
        cell_name: &str,
        cell_url: &str,
        private: RsaPrivateKey,
    ) -> RegistryResult<CellKeyPair> {
        let public = private.to_public_key();
        let now = chrono::Utc::now().timestamp();
        let cert = CellCertificate::issue(cell_url, &public, &self.root_private, now, CELL_CERT_SECS)
            .map_err(|e| RegistryError::Unavailable(anyhow::anyhow!("certificate issue: {e}")))?;
        let pair = CellKeyPair {
            key_id: Uuid::new_v4(),
            public_key: public,
            private_key: private,
            chain: vec![cert],
        };
        let mut pairs = self.pairs.write().await;
        pairs.insert(cell_name.to_string(), pair.clone());
        Ok(pair)
    }

    /// Replace a cell's pair under a new key id.
    pub async fn rotate(&self, cell_name: &str, cell_url: &str) -> RegistryResult<CellKeyPair> {
        self.provision(cell_name, cell_url).await
    }
}

#[async_trait]
impl KeyStore for UnitKeyStore {
    async fn current_key_pair(&self, cell_name: &str) -> RegistryResult<CellKeyPair> {
        let pairs = self.pairs.read().await;
        pairs
            .get(cell_name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("keys for cell {cell_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::rsa_key;
    use crate::token::trust;

    #[tokio::test]
    async fn provisioned_chain_anchors_in_the_unit_root() {
        let store = UnitKeyStore::new(rsa_key(0));
        let pair = store
            .provision_with_key("alpha", "https://alpha.example/", rsa_key(1))
            .await
            .expect("provision");
        let now = chrono::Utc::now().timestamp();
        trust::verify_chain(&pair.chain, store.root_public(), "https://alpha.example/", now)
            .expect("chain verifies");
        let fetched = store.current_key_pair("alpha").await.expect("fetch");
        assert_eq!(fetched.key_id, pair.key_id);
    }

    #[tokio::test]
    async fn rotation_changes_the_key_id() {
        let store = UnitKeyStore::new(rsa_key(0));
        let first = store
            .provision_with_key("alpha", "https://alpha.example/", rsa_key(1))
            .await
            .expect("provision");
        let second = store
            .provision_with_key("alpha", "https://alpha.example/", rsa_key(2))
            .await
            .expect("rotate");
        assert_ne!(first.key_id, second.key_id);
        let current = store.current_key_pair("alpha").await.expect("fetch");
        assert_eq!(current.key_id, second.key_id);
    }

    #[tokio::test]
    async fn missing_cell_has_no_keys() {
        let store = UnitKeyStore::new(rsa_key(0));
        assert!(matches!(
            store.current_key_pair("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
