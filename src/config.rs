//! Unit configuration.
//!
//! One explicit struct, built at startup from environment variables with
//! an optional YAML override file, and passed by reference from there on.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context};
use rand::RngCore;
use serde::Deserialize;

use crate::auth::lockout::LockoutConfig;

#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub bind_addr: SocketAddr,
    /// Base URL of this unit, trailing slash included.
    pub unit_url: String,
    /// Master bearer token. `None` disables unit-master access entirely.
    pub master_token: Option<String>,
    /// Cell URLs whose trans-cell tokens may address the unit itself.
    pub unit_user_issuers: Vec<String>,
    /// Resource-server credentials accepted at the introspection endpoint.
    pub introspect_username: Option<String>,
    pub introspect_password: Option<String>,
    /// Unit-wide AES-256-GCM secret sealing local tokens.
    pub token_secret: [u8; 32],
    pub lockout: LockoutConfig,
    /// Cell to create at startup, mostly for demos.
    pub seed_cell: Option<String>,
}

/// Shape of the optional YAML override file. Anything absent keeps the
/// env-derived value.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    bind_addr: Option<SocketAddr>,
    unit_url: Option<String>,
    master_token: Option<String>,
    unit_user_issuers: Option<Vec<String>>,
    introspect_username: Option<String>,
    introspect_password: Option<String>,
    token_secret: Option<String>,
    lockout_threshold: Option<u32>,
    lockout_cooldown_secs: Option<i64>,
    seed_cell: Option<String>,
}

impl UnitConfig {
    /// Minimal config for a unit at `unit_url`, with a random token
    /// secret and defaults everywhere else.
    pub fn for_unit(unit_url: &str) -> Self {
        UnitConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3300)),
            unit_url: ensure_trailing_slash(unit_url),
            master_token: None,
            unit_user_issuers: Vec::new(),
            introspect_username: None,
            introspect_password: None,
            token_secret: random_secret(),
            lockout: LockoutConfig::default(),
            seed_cell: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let unit_url = std::env::var("CELLTRUST_UNIT_URL")
            .unwrap_or_else(|_| "http://localhost:3300/".to_string());
        let mut config = UnitConfig::for_unit(&unit_url);
        if let Ok(addr) = std::env::var("CELLTRUST_BIND_ADDR") {
            config.bind_addr = addr.parse().context("CELLTRUST_BIND_ADDR")?;
        }
        if let Ok(token) = std::env::var("CELLTRUST_MASTER_TOKEN") {
            config.master_token = Some(token);
        }
        if let Ok(issuers) = std::env::var("CELLTRUST_UNIT_USER_ISSUERS") {
            config.unit_user_issuers = issuers
                .split(',')
                .filter(|s| !s.is_empty())
                .map(ensure_trailing_slash)
                .collect();
        }
        if let Ok(user) = std::env::var("CELLTRUST_INTROSPECT_USERNAME") {
            config.introspect_username = Some(user);
        }
        if let Ok(password) = std::env::var("CELLTRUST_INTROSPECT_PASSWORD") {
            config.introspect_password = Some(password);
        }
        if let Ok(hex_secret) = std::env::var("CELLTRUST_TOKEN_SECRET") {
            config.token_secret = parse_secret(&hex_secret)?;
        }
        if let Ok(threshold) = std::env::var("CELLTRUST_LOCKOUT_THRESHOLD") {
            config.lockout.threshold = threshold.parse().context("CELLTRUST_LOCKOUT_THRESHOLD")?;
        }
        if let Ok(cooldown) = std::env::var("CELLTRUST_LOCKOUT_COOLDOWN_SECS") {
            config.lockout.cooldown_secs =
                cooldown.parse().context("CELLTRUST_LOCKOUT_COOLDOWN_SECS")?;
        }
        if let Ok(seed) = std::env::var("CELLTRUST_SEED_CELL") {
            config.seed_cell = Some(seed);
        }
        Ok(config)
    }

    /// Env first, then the YAML file named by `CELLTRUST_CONFIG` on top,
    /// if set.
    pub fn from_env_or_yaml() -> anyhow::Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CELLTRUST_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let overrides: FileOverrides =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        self.apply(overrides)
    }

    fn apply(&mut self, overrides: FileOverrides) -> anyhow::Result<()> {
        if let Some(addr) = overrides.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(url) = overrides.unit_url {
            self.unit_url = ensure_trailing_slash(&url);
        }
        if let Some(token) = overrides.master_token {
            self.master_token = Some(token);
        }
        if let Some(issuers) = overrides.unit_user_issuers {
            self.unit_user_issuers = issuers.iter().map(|s| ensure_trailing_slash(s)).collect();
        }
        if let Some(user) = overrides.introspect_username {
            self.introspect_username = Some(user);
        }
        if let Some(password) = overrides.introspect_password {
            self.introspect_password = Some(password);
        }
        if let Some(hex_secret) = overrides.token_secret {
            self.token_secret = parse_secret(&hex_secret)?;
        }
        if let Some(threshold) = overrides.lockout_threshold {
            self.lockout.threshold = threshold;
        }
        if let Some(cooldown) = overrides.lockout_cooldown_secs {
            self.lockout.cooldown_secs = cooldown;
        }
        if let Some(seed) = overrides.seed_cell {
            self.seed_cell = Some(seed);
        }
        Ok(())
    }
}

pub fn ensure_trailing_slash<S: AsRef<str>>(url: S) -> String {
    let url = url.as_ref();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn parse_secret(hex_secret: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_secret).context("token secret must be hex")?;
    match <[u8; 32]>::try_from(bytes) {
        Ok(secret) => Ok(secret),
        Err(_) => bail!("token secret must be exactly 64 hex characters"),
    }
}
