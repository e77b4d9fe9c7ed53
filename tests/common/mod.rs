//! Shared harness for endpoint tests: a seeded unit with two user cells
//! and one app cell, driven through the router with `oneshot`.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use chrono::Utc;
use rsa::RsaPrivateKey;
use tower::ServiceExt;

use celltrust::app::{build_router, AppState};
use celltrust::auth::lockout::LockoutConfig;
use celltrust::config::UnitConfig;
use celltrust::registry::keys::{KeyStore, UnitKeyStore};
use celltrust::registry::InMemoryRegistry;
use celltrust::token::{CellToken, RoleRef, TokenKind, ACCESS_TOKEN_SECS};

pub const UNIT: &str = "https://unit.example/";
pub const ALPHA_URL: &str = "https://unit.example/alpha/";
pub const BETA_URL: &str = "https://unit.example/beta/";
pub const APP_URL: &str = "https://unit.example/appcell/";
pub const MASTER: &str = "master-secret";

static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();

fn rsa_key(i: usize) -> RsaPrivateKey {
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..4)
            .map(|_| RsaPrivateKey::new(&mut rng, 2048).expect("rsa keygen"))
            .collect()
    })[i]
        .clone()
}

pub struct Harness {
    pub state: AppState,
    pub router: Router,
    pub keystore: Arc<UnitKeyStore>,
    pub registry: Arc<InMemoryRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        let mut config = UnitConfig::for_unit(UNIT);
        config.master_token = Some(MASTER.to_string());
        config.unit_user_issuers = vec![ALPHA_URL.to_string()];
        config.introspect_username = Some("resource-server".to_string());
        config.introspect_password = Some("rs-password".to_string());
        config.lockout = LockoutConfig {
            threshold: 3,
            cooldown_secs: 300,
        };

        let keystore = Arc::new(UnitKeyStore::new(rsa_key(0)));
        for (cell, url, key) in [
            ("alpha", ALPHA_URL, 1),
            ("beta", BETA_URL, 2),
            ("appcell", APP_URL, 3),
        ] {
            keystore
                .provision_with_key(cell, url, rsa_key(key))
                .await
                .expect("provision");
        }

        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_cell("alpha", ALPHA_URL).await;
        registry.add_cell("beta", BETA_URL).await;
        registry.add_cell("appcell", APP_URL).await;
        registry
            .add_account(
                "alpha",
                "alice",
                "wonderland",
                vec![RoleRef::cell_level("reader")],
            )
            .await
            .expect("account");
        registry
            .grant_visitor_roles("beta", ALPHA_URL, vec![RoleRef::cell_level("friend")])
            .await
            .expect("grant");

        let root = keystore.root_public().clone();
        let state = AppState::new(
            config,
            registry.clone(),
            keystore.clone(),
            root,
        );
        let router = build_router(state.clone());
        Harness {
            state,
            router,
            keystore,
            registry,
        }
    }

    pub async fn post_form(&self, uri: &str, body: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn post_form_auth(&self, uri: &str, body: &str, authorization: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::AUTHORIZATION, authorization)
            .body(Body::from(body.to_string()))
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn get(&self, uri: &str, authorization: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let request = builder.body(Body::empty()).expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn post_bytes(&self, uri: &str, body: Vec<u8>) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    /// A signed TransCellAccess token minted by `issuer_cell` toward
    /// `audience`.
    pub async fn mint_trans(
        &self,
        issuer_cell: &str,
        issuer_url: &str,
        subject: &str,
        audience: &str,
        roles: Vec<RoleRef>,
    ) -> String {
        let keys = self
            .keystore
            .current_key_pair(issuer_cell)
            .await
            .expect("keys");
        let token = CellToken::new(
            TokenKind::TransCellAccess,
            subject,
            issuer_url,
            None,
            roles,
            Utc::now().timestamp(),
            ACCESS_TOKEN_SECS,
            Some(audience.to_string()),
        );
        self.state
            .codec
            .serialize_signed(&token, &keys)
            .expect("serialize")
    }
}

pub fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64_STD.encode(format!("{user}:{password}")))
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}
