//! Download worker runtime.
//!
//! Five cooperating parts: event intake feeds the dispatcher; the dispatcher
//! admits tasks and supervises pipelines; a pipeline drives one task through
//! fetch, hash and store; telemetry surfaces the observable effects; the
//! source registry provides the byte producers.

pub mod dispatcher;
pub mod intake;
pub mod pipeline;
pub mod stream;
pub mod telemetry;
pub mod throttle;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::bus::memory::InMemoryBus;
use crate::config::{Config, StorageProvider};
use crate::errors::TaskError;
use crate::events::{AuthConfig, ChecksumInfo};
use crate::observability::Metrics;
use crate::source::{DownloadOptions, SourceRegistry, SourceType};
use crate::storage::object::ObjectStoreBackend;
use crate::storage::StorageBackend;
use dispatcher::Dispatcher;
use intake::EventIntake;
use pipeline::Pipeline;
use telemetry::{spawn_progress_forwarder, TelemetryPublisher};
use throttle::ProgressThrottle;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The work order admitted into the worker; lives from intake decode until
/// its pipeline exits.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: u64,
    pub of_account_id: u64,
    /// Empty means derive from the source.
    pub file_name: String,
    pub source_url: String,
    pub source_type: SourceType,
    pub source_auth: Option<AuthConfig>,
    pub options: DownloadOptions,
    pub metadata: HashMap<String, Value>,
    pub checksum: Option<ChecksumInfo>,
    pub created_at: DateTime<Utc>,
}

/// Live progress of one execution.
#[derive(Debug, Clone)]
pub struct Progress {
    pub downloaded_bytes: u64,
    /// -1 while the total is unknown.
    pub total_bytes: i64,
    pub percentage: f64,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    fn empty() -> Self {
        Self {
            downloaded_bytes: 0,
            total_bytes: -1,
            percentage: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Hook for errors that must not interrupt a pipeline (telemetry publish
/// failures, cleanup failures).
pub type ErrorHandler = Arc<dyn Fn(&TaskError) + Send + Sync>;

pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|e| tracing::error!(code = e.code(), error = %e, "worker error"))
}

/// Run the worker until SIGINT/SIGTERM: wire the bus, storage, sources,
/// dispatcher, intake and operational API, then drain on shutdown.
pub async fn run(config: Config) -> Result<(), AnyError> {
    let bus = Arc::new(InMemoryBus::with_redelivery_backoff(
        config.bus.redelivery_backoff(),
    ));
    let storage = build_storage(&config)?;
    let sources = SourceRegistry::with_defaults(config.http.to_client_config())
        .map_err(|e| format!("failed to build source registry: {e}"))?;

    let telemetry = Arc::new(TelemetryPublisher::new(bus.clone()));
    let throttle = Arc::new(ProgressThrottle::new(config.worker.progress_interval()));
    let progress = spawn_progress_forwarder(telemetry.clone());
    let metrics = Arc::new(Metrics::new());

    let pipeline = Pipeline::new(
        storage,
        telemetry.clone(),
        throttle.clone(),
        progress,
        log_error_handler(),
        config.worker.retry_backoff_cap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        sources,
        pipeline,
        telemetry,
        throttle,
        metrics.clone(),
        config.worker.max_concurrent,
    ));

    let shutdown = CancellationToken::new();
    let intake = EventIntake::new(bus.clone(), dispatcher.clone());
    let consumers = intake
        .start(shutdown.clone())
        .await
        .map_err(|e| format!("failed to start event intake: {e}"))?;

    let api_state = api::AppState::new(dispatcher.clone(), metrics);
    let api_task = tokio::spawn(api::serve(
        config.server.bind_addr,
        api_state,
        shutdown.clone(),
    ));

    info!(
        max_concurrent = config.worker.max_concurrent,
        "worker started"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    // Stop taking new work, cancel in-flight pipelines, then wait for them
    // to unwind.
    shutdown.cancel();
    dispatcher.cancel_all();

    let deadline = tokio::time::Instant::now() + config.worker.drain_timeout();
    while dispatcher.active_task_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                active = dispatcher.active_task_count(),
                "drain timeout reached, exiting with tasks in flight"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for consumer in consumers {
        let _ = consumer.await;
    }
    let _ = api_task.await;

    info!("worker stopped");
    Ok(())
}

fn build_storage(config: &Config) -> Result<Arc<dyn StorageBackend>, AnyError> {
    let backend = match config.storage.provider {
        StorageProvider::Memory => ObjectStoreBackend::memory(),
        StorageProvider::Local => {
            let path = config
                .storage
                .path
                .as_ref()
                .ok_or("storage.path is required for the local provider")?;
            std::fs::create_dir_all(path)?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(path)?;
            ObjectStoreBackend::new(Arc::new(store), config.storage.bucket.clone())
        }
    };
    Ok(Arc::new(backend))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
