use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::CinderConfig;
use crate::dispatch::SnapshotGitSource;
use crate::scheduler::TracingSink;
use crate::service::ActionsService;

/// Build the full application router: runner RPC and operator API.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let app = api::api_router().with_state(state);
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the server and the background loops; returns after Ctrl+C once
/// both have stopped.
pub async fn start_server(config: CinderConfig) -> Result<()> {
    let git = Arc::new(SnapshotGitSource::new());
    let service = ActionsService::open(&config, git.clone(), Arc::new(TracingSink))?;

    let shutdown = CancellationToken::new();
    let background = service.spawn_background(shutdown.clone());

    let state = Arc::new(AppState { service, git });
    let app = build_router(state, config.cors);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        db = %config.db_path.display(),
        logs = %config.log_dir.display(),
        "Cinder listening"
    );

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    for result in join_all(background).await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
