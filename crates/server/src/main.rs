use std::{net::SocketAddr, sync::Arc};

use engine::EngineContext;
use storage::Storage;
use tracing::{error, info};

mod api;
mod app_state;
mod config;
mod hub;
mod providers;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use hub::LocalHub;
use providers::{LogPush, PassThroughScanner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = build_state(storage, &settings);
    let engine = state.engine.clone();
    let app = api::build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining background work");
    engine.settle().await;
    Ok(())
}

fn build_state(storage: Storage, settings: &config::Settings) -> AppState {
    let hub = LocalHub::default();
    let engine = EngineContext::new(
        storage,
        settings.engine_config(),
        Arc::new(hub.clone()),
        Arc::new(hub.clone()),
        Arc::new(PassThroughScanner),
        Arc::new(LogPush),
    );
    AppState { engine, hub }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received Ctrl+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C, shutting down");
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
