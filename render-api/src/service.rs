//! The external request surface: create, get, cancel, stats.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, warn};

use render_common::job::{JobDraft, JobStatus, Operation, OperationKind};
use render_common::store::{JobStore, QueueStats, StoreError};
use render_common::webhook::{validate_webhook_url, WebhookUrlError};
use render_scheduler::error::SchedulerError;
use render_scheduler::lifecycle::Lifecycle;
use render_scheduler::reconciler;
use render_scheduler::remote::{RemoteExecutor, RemoteState};

/// Queue depths that trigger pressure alerts.
const PRESSURE_WARNING: usize = 15;
const PRESSURE_CRITICAL: usize = 25;
const PRESSURE_OVERLOAD: usize = 40;

/// At most one pressure alert per this window, across all levels.
const ALERT_THROTTLE_SECS: u64 = 60;

/// Enumeration of request-surface errors; each maps to one HTTP
/// status in the handlers.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown operation {0}")]
    UnknownOperation(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid webhook url: {0}")]
    InvalidWebhook(#[from] WebhookUrlError),
    #[error("job {0} does not exist")]
    NotFound(String),
    #[error("job {0} is already terminal")]
    AlreadyTerminal(String),
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("scheduler operation failed: {0}")]
    Scheduler(SchedulerError),
}

impl From<SchedulerError> for ServiceError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::JobNotFound(id) => ServiceError::NotFound(id),
            SchedulerError::AlreadyTerminal(id) => ServiceError::AlreadyTerminal(id),
            other => ServiceError::Scheduler(other),
        }
    }
}

/// Accepted-job response for `POST /jobs/{operation}`.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    /// One-based position in the pending queue.
    pub queue_position: usize,
    /// Advisory estimate derived from per-operation averages.
    pub estimated_wait_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct JobProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
}

/// Current-state response for `GET /jobs/{id}`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub operation: Operation,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Diagnostic dump for `GET /admin/workers/status`.
#[derive(Debug, Serialize)]
pub struct WorkersStatus {
    pub max_workers: u32,
    pub available_workers: u32,
    pub queue_depth: usize,
    pub active_jobs: Vec<ActiveJobSummary>,
}

#[derive(Debug, Serialize)]
pub struct ActiveJobSummary {
    pub job_id: String,
    pub operation: Operation,
    pub status: JobStatus,
    pub workers_reserved: u32,
    pub remote_job_ids: Vec<String>,
}

/// Typical wall-clock seconds per operation, used only for the
/// advisory wait estimate returned at submission.
fn average_duration_seconds(kind: OperationKind) -> u64 {
    match kind {
        OperationKind::Img2Vid => 480,
        OperationKind::Concatenate => 240,
        OperationKind::ConcatVideoAudio | OperationKind::Trilhasonora => 180,
        OperationKind::Transcribe => 300,
        OperationKind::Caption
        | OperationKind::AddAudio
        | OperationKind::CaptionSegments
        | OperationKind::CaptionHighlight => 120,
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    lifecycle: Arc<Lifecycle>,
    remote: Arc<dyn RemoteExecutor>,
    dispatch_signal: Arc<Notify>,
    local_signal: Arc<Notify>,
    max_workers: u32,
    last_pressure_alert: Mutex<Option<Instant>>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        lifecycle: Arc<Lifecycle>,
        remote: Arc<dyn RemoteExecutor>,
        dispatch_signal: Arc<Notify>,
        local_signal: Arc<Notify>,
        max_workers: u32,
    ) -> Self {
        Self {
            store,
            lifecycle,
            remote,
            dispatch_signal,
            local_signal,
            max_workers,
            last_pressure_alert: Mutex::new(None),
        }
    }

    /// Validate, persist and enqueue a new job.
    pub async fn create(
        &self,
        operation: &str,
        payload: Value,
        webhook_url: String,
        correlation_id: Option<i64>,
        path_root: Option<String>,
    ) -> Result<SubmitResponse, ServiceError> {
        let operation: Operation = operation
            .parse()
            .map_err(|_| ServiceError::UnknownOperation(operation.to_owned()))?;

        if !payload.is_object() {
            return Err(ServiceError::InvalidPayload(
                "payload must be a JSON object".to_owned(),
            ));
        }
        // The single structural requirement the scheduler has: image
        // batches drive reservation sizing.
        if operation.kind == OperationKind::Img2Vid {
            let images = payload.get("images").and_then(Value::as_array);
            if images.map_or(true, Vec::is_empty) {
                return Err(ServiceError::InvalidPayload(
                    "img2vid requires a non-empty images array".to_owned(),
                ));
            }
        }

        validate_webhook_url(&webhook_url).await?;

        let job = self
            .store
            .create(JobDraft {
                operation,
                payload,
                webhook_url,
                correlation_id,
                path_root,
            })
            .await?;
        self.store.enqueue(&job.id).await?;
        metrics::counter!("jobs_created_total").increment(1);

        self.dispatch_signal.notify_one();
        if operation.local {
            self.local_signal.notify_one();
        }

        let depth = self.store.queue_depth().await?;
        let queue_position = self
            .store
            .queue_position(&job.id)
            .await?
            .map(|position| position + 1)
            .unwrap_or(depth.max(1));

        let rounds = (queue_position as u64).div_ceil(u64::from(self.max_workers.max(1)));
        let estimated_wait_seconds = average_duration_seconds(operation.kind) * rounds;

        self.assess_queue_pressure(depth);

        Ok(SubmitResponse {
            job_id: job.id,
            status: JobStatus::Queued,
            queue_position,
            estimated_wait_seconds,
        })
    }

    /// Current state plus live chunk progress for active remote jobs.
    pub async fn get(&self, id: &str) -> Result<StatusResponse, ServiceError> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_owned()))?;

        let queue_position = if job.status == JobStatus::Queued {
            self.store
                .queue_position(&job.id)
                .await?
                .map(|position| position + 1)
        } else {
            None
        };

        let mut progress = None;
        let mut estimated_completion = None;
        if job.status.is_active() && !job.operation.local && !job.remote_job_ids.is_empty() {
            let total = job.remote_job_ids.len();
            let mut completed = 0;
            for remote_id in &job.remote_job_ids {
                match self.remote.status(remote_id).await {
                    Ok(status) if status.state == RemoteState::Completed => completed += 1,
                    Ok(_) => {}
                    // A stale poll only degrades the progress figure.
                    Err(_) => {}
                }
            }
            let percentage = (completed * 100 / total) as u32;
            if percentage > 0 && percentage < 100 {
                let anchor = job.submitted_at.unwrap_or(job.created_at);
                let elapsed = Utc::now() - anchor;
                let projected_total = elapsed * 100 / percentage as i32;
                estimated_completion = Some(anchor + projected_total);
            }
            progress = Some(JobProgress {
                completed,
                total,
                percentage,
            });
        }

        Ok(StatusResponse {
            job_id: job.id,
            operation: job.operation,
            status: job.status,
            queue_position,
            progress,
            estimated_completion,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            submitted_at: job.submitted_at,
            processing_started_at: job.processing_started_at,
            completed_at: job.completed_at,
        })
    }

    /// Cancel a job; rejected with 409 semantics when terminal.
    pub async fn cancel(&self, id: &str) -> Result<StatusResponse, ServiceError> {
        self.lifecycle.cancel(id).await?;
        self.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.store.stats().await?)
    }

    /// Force a reconciliation pass; returns the counter correction.
    pub async fn recover_workers(&self) -> Result<i64, ServiceError> {
        let report = reconciler::reconcile(self.store.as_ref(), self.max_workers).await?;
        Ok(report.correction)
    }

    pub async fn workers_status(&self) -> Result<WorkersStatus, ServiceError> {
        let active = self.store.active().await?;
        Ok(WorkersStatus {
            max_workers: self.max_workers,
            available_workers: self.store.available().await?,
            queue_depth: self.store.queue_depth().await?,
            active_jobs: active
                .into_iter()
                .map(|job| ActiveJobSummary {
                    job_id: job.id,
                    operation: job.operation,
                    status: job.status,
                    workers_reserved: job.workers_reserved,
                    remote_job_ids: job.remote_job_ids,
                })
                .collect(),
        })
    }

    /// Observability only: deep queues log an alert, throttled to one
    /// per minute; work is never rejected for depth.
    fn assess_queue_pressure(&self, depth: usize) {
        metrics::gauge!("queue_depth").set(depth as f64);
        if depth < PRESSURE_WARNING {
            return;
        }

        let mut last_alert = self.last_pressure_alert.lock().unwrap();
        let throttled = last_alert
            .is_some_and(|at| at.elapsed().as_secs() < ALERT_THROTTLE_SECS);
        if throttled {
            return;
        }
        *last_alert = Some(Instant::now());

        if depth >= PRESSURE_OVERLOAD {
            error!(depth, "queue overloaded");
            metrics::counter!("queue_pressure_alerts_total", "level" => "overload").increment(1);
        } else if depth >= PRESSURE_CRITICAL {
            error!(depth, "queue critically deep");
            metrics::counter!("queue_pressure_alerts_total", "level" => "critical").increment(1);
        } else {
            warn!(depth, "queue pressure rising");
            metrics::counter!("queue_pressure_alerts_total", "level" => "warning").increment(1);
        }
    }
}
