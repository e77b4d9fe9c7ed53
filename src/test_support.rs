//! Shared unit-test fixtures. RSA key generation dominates test time, so
//! a small pool of keys is generated once per test binary.

use std::sync::OnceLock;

use rsa::RsaPrivateKey;

static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();

/// Fixture key `i` (0..=2), 2048 bits.
pub fn rsa_key(i: usize) -> RsaPrivateKey {
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..3)
            .map(|_| RsaPrivateKey::new(&mut rng, 2048).expect("rsa keygen"))
            .collect()
    })[i]
        .clone()
}
