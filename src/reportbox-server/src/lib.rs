//! reportbox server - report management API with streamed ZIP export.
//!
//! This crate provides:
//! - The access gate deciding every operation from the caller's session
//! - Bulk export of report files as a ZIP streamed while it is written
//! - An export ledger backing the explicit purge of exported reports
//! - Task and report management endpoints, report upload and local accounts
//! - Session token validation and a small CLI

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod export;
pub mod gate;
pub mod middleware;
pub mod password;
pub mod state;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::ServerConfig;
pub use error::{AppError, AppResult};
pub use state::AppState;

/// Run the server with the given configuration.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, std::future::pending()).await
}

/// Run the server with graceful shutdown support.
///
/// After `shutdown` resolves, in-flight exports get `shutdown_timeout`
/// seconds to finish before the server stops waiting for them.
pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState::new(config.clone()).await?);
    if !state.auth.is_configured() {
        warn!("No JWT secret configured: every gated endpoint will answer 401");
        warn!("Set REPORTBOX_JWT_SECRET or auth.jwt_secret to accept sessions.");
    }
    state.start_cleanup_task();
    let app = create_router_with_state(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("Starting reportbox server on {}", addr);

    let draining = Arc::new(Notify::new());
    let signal = Arc::clone(&draining);
    let listener = TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            signal.notify_one();
        })
        .into_future();

    let grace = Duration::from_secs(config.shutdown_timeout);
    tokio::select! {
        result = server => result?,
        () = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("Shutdown grace period of {:?} elapsed, dropping open connections", grace);
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    create_router_with_state(Arc::new(state))
}

/// Create the application router with an Arc-wrapped state.
pub fn create_router_with_state(state: Arc<AppState>) -> Router {
    let cors_origins = state.config.cors_origins.clone();

    api::routes(&state.config)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::session_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::timeout_middleware,
        ))
        .layer(axum::middleware::from_fn(
            middleware::request_context_middleware,
        ))
        .layer(middleware::cors_layer(&cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
