//! The `toolgate` binary: load config, open the store, wire the state,
//! spawn the delivery worker and background loops, and serve.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use toolgate_core::store::CatalogStore;
use toolgate_server::{AppState, ServerConfig, jobs, queue, routes};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::load().context("failed to load configuration")?;
    config
        .validate()
        .map_err(|message| anyhow::anyhow!(message))?;

    let store = Arc::new(
        CatalogStore::open(&config.database_path).context("failed to open catalog store")?,
    );
    info!(path = %config.database_path.display(), "catalog store ready");

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    let (state, queue_rx) = AppState::from_config(config, store);
    let _delivery_worker =
        queue::spawn_delivery_worker(state.store.clone(), state.metrics.clone(), queue_rx);
    let _background_jobs = jobs::spawn_background_jobs(state.clone());

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(%listen_addr, "toolgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
