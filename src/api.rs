//! Operational HTTP surface of the worker: liveness and a status snapshot.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::observability::{Metrics, MetricsSnapshot};
use crate::worker::dispatcher::Dispatcher;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>) -> Self {
        Self {
            dispatcher,
            metrics,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    components: HashMap<String, String>,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    active_tasks: usize,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

pub async fn serve(
    address: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), AnyError> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "worker API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());
    components.insert("dispatcher".to_string(), "healthy".to_string());

    Json(HealthResponse {
        status: "healthy".to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        active_tasks: state.dispatcher.active_task_count(),
        metrics: state.metrics.snapshot(),
    })
}
