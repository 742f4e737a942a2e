//! Task dispatcher: owns the active-task registry and the admission
//! semaphore, and routes pause/resume/cancel commands to the right
//! execution.
//!
//! The registry map and the semaphore are deliberately two separate shared
//! resources: admission must be acquirable while the registry is being read
//! for unrelated tasks.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pipeline::Pipeline;
use super::stream::PauseGate;
use super::telemetry::TelemetryPublisher;
use super::throttle::ProgressThrottle;
use super::{Progress, TaskRequest};
use crate::errors::TaskError;
use crate::events::TaskStatus;
use crate::observability::Metrics;
use crate::source::SourceRegistry;

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// State of one admitted task, shared between its pipeline and the control
/// plane. The pipeline owns execution; commands reach it only through the
/// thread-safe operations here.
pub struct TaskExecution {
    request: TaskRequest,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
    pause: Mutex<Option<Arc<PauseGate>>>,
    storage_key: Mutex<Option<String>>,
}

impl TaskExecution {
    fn new(request: TaskRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            progress: Mutex::new(Progress::empty()),
            pause: Mutex::new(None),
            storage_key: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().clone()
    }

    /// Pause handle, present once the stream is open.
    fn pause_gate(&self) -> Option<Arc<PauseGate>> {
        self.pause.lock().clone()
    }

    pub(super) fn attach_gate(&self, gate: Arc<PauseGate>) {
        *self.pause.lock() = Some(gate);
    }

    pub(super) fn set_total_bytes(&self, total: i64) {
        self.progress.lock().total_bytes = total;
    }

    pub(super) fn update_progress(&self, downloaded: u64) -> Progress {
        let mut progress = self.progress.lock();
        progress.downloaded_bytes = downloaded;
        if progress.total_bytes > 0 {
            progress.percentage = downloaded as f64 / progress.total_bytes as f64 * 100.0;
        }
        progress.updated_at = chrono::Utc::now();
        progress.clone()
    }

    /// Final snapshot for the terminal 100% event.
    pub(super) fn complete_progress(&self) -> Progress {
        let mut progress = self.progress.lock();
        if progress.total_bytes < 0 {
            progress.total_bytes = progress.downloaded_bytes as i64;
        }
        progress.percentage = 100.0;
        progress.updated_at = chrono::Utc::now();
        progress.clone()
    }

    pub(super) fn set_storage_key(&self, key: String) {
        *self.storage_key.lock() = Some(key);
    }

    pub(super) fn storage_key(&self) -> Option<String> {
        self.storage_key.lock().clone()
    }
}

pub struct Dispatcher {
    sources: SourceRegistry,
    active: RwLock<HashMap<u64, Arc<TaskExecution>>>,
    admission: Arc<Semaphore>,
    pipeline: Pipeline,
    telemetry: Arc<TelemetryPublisher>,
    throttle: Arc<ProgressThrottle>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        sources: SourceRegistry,
        pipeline: Pipeline,
        telemetry: Arc<TelemetryPublisher>,
        throttle: Arc<ProgressThrottle>,
        metrics: Arc<Metrics>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            sources,
            active: RwLock::new(HashMap::new()),
            admission: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pipeline,
            telemetry,
            throttle,
            metrics,
        }
    }

    /// Execute one task to completion. Blocks until the pipeline terminates.
    ///
    /// Admission blocks until a slot frees up or `caller` is cancelled
    /// (`TOO_MANY_REQUESTS`). A task id already executing is `CONFLICT`; an
    /// unsupported source type is `INVALID_INPUT`.
    pub async fn execute_task(
        &self,
        caller: &CancellationToken,
        request: TaskRequest,
    ) -> Result<(), TaskError> {
        let permit = tokio::select! {
            _ = caller.cancelled() => {
                return Err(TaskError::TooManyRequests(
                    "admission interrupted before a slot became free".into(),
                ));
            }
            permit = self.admission.clone().acquire_owned() => permit
                .map_err(|e| TaskError::internal("admission semaphore closed", e))?,
        };

        let adapter = self.sources.get(request.source_type).ok_or_else(|| {
            TaskError::InvalidInput(format!("unsupported source type: {}", request.source_type))
        })?;

        let task_id = request.task_id;
        let timeout = request.options.timeout;

        // Insert atomically with the duplicate check; deletion is deferred to
        // pipeline exit on every path.
        let execution = {
            let mut active = self.active.write();
            if active.contains_key(&task_id) {
                return Err(TaskError::Conflict(format!(
                    "task {task_id} is already running"
                )));
            }
            let execution = Arc::new(TaskExecution::new(request, caller.child_token()));
            active.insert(task_id, execution.clone());
            execution
        };

        info!(task_id, "task admitted");
        self.metrics.task_started();

        let outcome = tokio::time::timeout(timeout, self.pipeline.run(&execution, adapter)).await;

        self.active.write().remove(&task_id);
        self.throttle.forget(task_id);
        drop(permit);

        match &outcome {
            Ok(Ok(())) => self.metrics.task_completed(),
            _ => self.metrics.task_failed(),
        }

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // Wall-clock expiry; the pipeline future was dropped, so the
                // failure event and partial-object cleanup happen here.
                warn!(task_id, timeout_secs = timeout.as_secs(), "task timed out");
                execution.cancel.cancel();
                Err(self.pipeline.abort(&execution, "task timed out").await)
            }
        }
    }

    /// Pause a running task. `CONFLICT` until its stream is open.
    pub async fn pause_task(&self, task_id: u64) -> Result<(), TaskError> {
        let execution = self.lookup(task_id)?;
        let gate = execution.pause_gate().ok_or_else(|| {
            TaskError::Conflict("task download has not started yet, cannot pause".into())
        })?;

        gate.pause();
        if let Err(e) = self
            .telemetry
            .publish_status_updated(task_id, TaskStatus::Paused)
            .await
        {
            // Keep observable state consistent with what was announced.
            gate.resume();
            return Err(e);
        }
        info!(task_id, "task paused");
        Ok(())
    }

    /// Resume a paused task. Resuming a task that is not paused is a no-op.
    pub async fn resume_task(&self, task_id: u64) -> Result<(), TaskError> {
        let execution = self.lookup(task_id)?;
        let gate = execution.pause_gate().ok_or_else(|| {
            TaskError::Conflict("task is not in a state that can be resumed".into())
        })?;

        gate.resume();
        self.telemetry
            .publish_status_updated(task_id, TaskStatus::Downloading)
            .await?;
        info!(task_id, "task resumed");
        Ok(())
    }

    /// Cancel a running task. Irrevocable; the pipeline unwinds at its next
    /// suspension point.
    pub async fn cancel_task(&self, task_id: u64) -> Result<(), TaskError> {
        let execution = self.lookup(task_id)?;
        execution.cancel.cancel();
        info!(task_id, "task cancelled");
        self.telemetry
            .publish_status_updated(task_id, TaskStatus::Cancelled)
            .await
    }

    pub fn active_task_count(&self) -> usize {
        self.active.read().len()
    }

    /// Cancel every in-flight execution (graceful shutdown).
    pub fn cancel_all(&self) {
        for execution in self.active.read().values() {
            execution.cancel.cancel();
        }
    }

    fn lookup(&self, task_id: u64) -> Result<Arc<TaskExecution>, TaskError> {
        self.active
            .read()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(format!("task {task_id} is not active")))
    }
}
