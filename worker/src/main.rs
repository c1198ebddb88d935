mod config;
mod generator;
mod handlers;
mod logs;
mod runtime;
mod staging;
mod state;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use ecco_common::LocalStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::HostConfig;
use crate::generator::ProcessGenerator;
use crate::state::HostState;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ecco_worker=debug,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = HostConfig::from_env();

    // Nombre de host (solo para info)
    let hostname_str = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let bind = config.bind.clone();
    info!(
        "host {}: concurrency={} fetch={} scratch={}",
        hostname_str,
        config.concurrency,
        config.fetch_concurrency,
        config.scratch_dir.display()
    );

    let state = HostState::new(config, Arc::new(LocalStore), Arc::new(ProcessGenerator));
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", bind))?;
    info!("host de funciones escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
