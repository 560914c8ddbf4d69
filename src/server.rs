//! HTTP snapshot endpoint
//!
//! Serves whatever the run loop last published on the watch channel; the
//! handler never touches the engine itself.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

use crate::snapshot::Snapshot;

pub fn router(snapshots: watch::Receiver<Snapshot>) -> Router {
    Router::new()
        .route("/portfolio", get(portfolio))
        .route("/health", get(health))
        .with_state(snapshots)
}

async fn portfolio(State(snapshots): State<watch::Receiver<Snapshot>>) -> Json<Snapshot> {
    Json(snapshots.borrow().clone())
}

async fn health() -> &'static str {
    "ok"
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(
    addr: SocketAddr,
    snapshots: watch::Receiver<Snapshot>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Snapshot server listening");
    axum::serve(listener, router(snapshots))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
