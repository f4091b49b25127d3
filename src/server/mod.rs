//! HTTP surface: REST API, per-run SSE streams and the dashboard WebSocket.

pub mod api;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::app::App;
use api::AppState;

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let feed = state.orchestrator.events().feed();

    api::api_router()
        .route("/ws", get(move |ws_upgrade| ws::feed_handler(ws_upgrade, feed)))
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM, then drain in-flight runs.
pub async fn serve(mut app: App) -> Result<()> {
    app.recover_interrupted().await?;
    app.prepare().await;
    app.spawn_background();
    let state = Arc::new(AppState {
        orchestrator: app.orchestrator.clone(),
    });

    let mut router = build_router(state);
    if app.config.server.cors {
        router = router.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", app.config.server.host, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "AutoCTF API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
