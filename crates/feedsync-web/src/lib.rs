//! Admin HTTP surface: manual collector triggers, heartbeat and run stats.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feedsync_sync::{CollectorRegistry, RunStats, TriggerError};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "feedsync-web";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CollectorRegistry>,
}

impl AppState {
    pub fn new(registry: CollectorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/run/{collector}", post(run_handler))
        .route("/ping", get(ping_handler))
        .route("/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "admin http listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("admin http stopped");
    Ok(())
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Path(collector): Path<String>,
) -> Response {
    match state.registry.trigger(&collector) {
        // Runs continue in the background; the response does not wait for them.
        Ok(_handles) => Json(StatusBody { status: "ok" }).into_response(),
        Err(TriggerError::UnknownCollector(name)) => {
            warn!(collector = name.as_str(), "run requested for unknown collector");
            (
                StatusCode::NOT_FOUND,
                Json(StatusBody {
                    status: "unknown collector",
                }),
            )
                .into_response()
        }
    }
}

async fn ping_handler() -> &'static str {
    "."
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RunStats>> {
    Json(state.registry.stats())
}
