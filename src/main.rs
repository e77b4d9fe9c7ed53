use std::sync::Arc;

use celltrust::app::{build_router, AppState};
use celltrust::config::{ensure_trailing_slash, UnitConfig};
use celltrust::observability;
use celltrust::registry::keys::UnitKeyStore;
use celltrust::registry::InMemoryRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = UnitConfig::from_env_or_yaml()?;
    observability::init("celltrust=info,tower_http=info");

    let keys = Arc::new(UnitKeyStore::generate()?);
    let registry = Arc::new(InMemoryRegistry::new());
    if let Some(name) = &config.seed_cell {
        let url = ensure_trailing_slash(format!("{}{name}", config.unit_url));
        registry.add_cell(name, &url).await;
        keys.provision(name, &url).await?;
        tracing::info!(cell = %name, %url, "seed cell provisioned");
    }

    let bind_addr = config.bind_addr;
    let root = keys.root_public().clone();
    let state = AppState::new(config, registry, keys, root);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "celltrust listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}
