//! Scheduling HTTP API.
//!
//! Routes:
//! - `POST /interactions` schedules one interaction
//! - `POST /interactions/batch` schedules many
//! - `GET /interactions/{id}` returns the current row
//! - `POST /reconcile` runs one manual reconcile tick
//! - `GET /health` liveness probe

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GlobalConfig;
use crate::orchestrator::reconciler::Reconciler;
use crate::persistence::interaction_repo::InteractionRepo;
use crate::publisher::Publisher;
use crate::{AppError, Result};

/// State shared by the HTTP API and the IPC server.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Scheduled interaction store.
    pub interactions: InteractionRepo,
    /// Delay topology publisher.
    pub publisher: Publisher,
    /// Pull-path worker, also used for manual reconciles.
    pub reconciler: Arc<Reconciler>,
}

/// Build the API router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/interactions", post(handlers::schedule_one))
        .route("/interactions/batch", post(handlers::schedule_batch))
        .route("/interactions/{id}", get(handlers::get_interaction))
        .route("/reconcile", post(handlers::reconcile))
        .with_state(state)
}

/// Serve the API on `config.http_port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener fails to bind, or
/// `AppError::Io` if the server stops abnormally.
pub async fn serve_http(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind http api on {bind}: {err}")))?;

    info!(%bind, "scheduling api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await?;

    info!("scheduling api shut down");
    Ok(())
}
