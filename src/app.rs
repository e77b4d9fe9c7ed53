//! Application state and router.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use rsa::RsaPublicKey;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::auth::lockout::LockoutCounter;
use crate::config::UnitConfig;
use crate::registry::keys::KeyStore;
use crate::registry::CellRegistry;
use crate::token::codec::TokenCodec;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<UnitConfig>,
    pub registry: Arc<dyn CellRegistry>,
    pub keys: Arc<dyn KeyStore>,
    pub codec: Arc<TokenCodec>,
    pub lockout: Arc<LockoutCounter>,
}

impl AppState {
    /// `unit_root` is the public half of the key the key store anchors
    /// cell certificates in.
    pub fn new(
        config: UnitConfig,
        registry: Arc<dyn CellRegistry>,
        keys: Arc<dyn KeyStore>,
        unit_root: RsaPublicKey,
    ) -> Self {
        let codec = TokenCodec::new(config.token_secret, unit_root);
        let lockout = LockoutCounter::new(config.lockout.clone());
        AppState {
            config: Arc::new(config),
            registry,
            keys,
            codec: Arc::new(codec),
            lockout: Arc::new(lockout),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/:cell/__token", post(api::token::token))
        .route("/:cell/__introspect", post(api::introspect::introspect))
        .route("/:cell/__authz", get(api::authz::authz))
        .route("/:cell/__sign", post(api::sign::sign))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
