//! Remote-job tracking: the active poll, the timeout sweep, and the
//! periodic reconciliation tick.
//!
//! The three loops are independent tickers sharing nothing but the
//! store; each reports its own liveness and observes the one shutdown
//! signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use render_common::health::Heartbeat;
use render_common::job::{Job, JobPatch, JobStatus, OperationKind};
use render_common::store::JobStore;

use crate::error::SchedulerError;
use crate::lifecycle::Lifecycle;
use crate::reconciler;
use crate::remote::{RemoteError, RemoteExecutor, RemoteJobStatus, RemoteState};

/// Extra budget in minutes for jobs the executor has not started yet,
/// covering executor-side queue time.
const QUEUE_GRACE_MINUTES: i64 = 60;

/// Execution-phase budget per operation, queue time excluded.
pub fn execution_budget(kind: OperationKind) -> chrono::Duration {
    match kind {
        OperationKind::Img2Vid => chrono::Duration::minutes(45),
        OperationKind::Concatenate => chrono::Duration::minutes(20),
        OperationKind::ConcatVideoAudio | OperationKind::Trilhasonora => {
            chrono::Duration::minutes(15)
        }
        OperationKind::Caption
        | OperationKind::AddAudio
        | OperationKind::CaptionSegments
        | OperationKind::CaptionHighlight => chrono::Duration::minutes(10),
        OperationKind::Transcribe => chrono::Duration::minutes(30),
    }
}

pub struct Monitor {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteExecutor>,
    lifecycle: Arc<Lifecycle>,
    max_workers: u32,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteExecutor>,
        lifecycle: Arc<Lifecycle>,
        max_workers: u32,
    ) -> Self {
        Self {
            store,
            remote,
            lifecycle,
            max_workers,
        }
    }

    pub async fn run_poll_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("active poll shutting down");
                        return;
                    }
                }
            }
            heartbeat.beat();
            if let Err(err) = self.poll_active().await {
                error!("active poll failed: {}", err);
            }
        }
    }

    pub async fn run_timeout_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("timeout sweep shutting down");
                        return;
                    }
                }
            }
            heartbeat.beat();
            if let Err(err) = self.sweep_timeouts().await {
                error!("timeout sweep failed: {}", err);
            }
        }
    }

    pub async fn run_reconcile_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconcile loop shutting down");
                        return;
                    }
                }
            }
            heartbeat.beat();
            if let Err(err) = reconciler::reconcile(self.store.as_ref(), self.max_workers).await {
                error!("reconciliation failed: {}", err);
            }
            match self.store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired job records purged"),
                Err(err) => error!("expired-job purge failed: {}", err),
            }
        }
    }

    /// Poll every active remote job once.
    pub async fn poll_active(&self) -> Result<(), SchedulerError> {
        let active = self.store.active().await?;
        for job in active.iter().filter(|job| !job.operation.local) {
            if let Err(err) = self.poll_job(job).await {
                error!(job_id = job.id, "poll handling failed: {}", err);
            }
        }
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<(), SchedulerError> {
        let polls = join_all(
            job.remote_job_ids
                .iter()
                .map(|remote_id| self.remote.status(remote_id)),
        )
        .await;

        let mut statuses: Vec<RemoteJobStatus> = Vec::with_capacity(polls.len());
        for (remote_id, poll) in job.remote_job_ids.iter().zip(polls) {
            match poll {
                Ok(status) => statuses.push(status),
                Err(RemoteError::NotFound(_)) => {
                    // Executor-side state loss, e.g. the endpoint was
                    // recreated. The only poll error that drives a
                    // transition.
                    warn!(job_id = job.id, remote_id, "remote job vanished");
                    return self
                        .lifecycle
                        .fail(&job.id, format!("orphaned remote job {remote_id}"))
                        .await;
                }
                Err(err) => {
                    // Transient poll error: try again next tick.
                    debug!(job_id = job.id, remote_id, "status poll failed: {}", err);
                    return Ok(());
                }
            }
        }

        if let Some(failed) = statuses.iter().find(|status| status.state.is_failure()) {
            let reason = statuses
                .iter()
                .find_map(|status| status.error.clone())
                .unwrap_or_else(|| format!("remote job reported {}", failed.state));
            return self.lifecycle.fail(&job.id, reason).await;
        }

        if !statuses.is_empty()
            && statuses
                .iter()
                .all(|status| status.state == RemoteState::Completed)
        {
            let outputs = statuses
                .into_iter()
                .map(|status| status.output.unwrap_or(serde_json::Value::Null))
                .collect();
            return self.lifecycle.complete(&job.id, outputs).await;
        }

        if job.status == JobStatus::Submitted
            && statuses
                .iter()
                .any(|status| status.state == RemoteState::InProgress)
        {
            // First sign of execution: anchor the execution-phase
            // timeout here.
            self.store
                .update(
                    &job.id,
                    JobPatch {
                        status: Some(JobStatus::Processing),
                        processing_started_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            debug!(job_id = job.id, "job processing");
        }
        Ok(())
    }

    /// Fail every active remote job that outlived its phase budget.
    pub async fn sweep_timeouts(&self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let active = self.store.active().await?;
        for job in active.iter().filter(|job| !job.operation.local) {
            let anchor = job
                .processing_started_at
                .or(job.submitted_at)
                .unwrap_or(job.created_at);
            let mut budget = execution_budget(job.operation.kind);
            if job.processing_started_at.is_none() {
                budget = budget + chrono::Duration::minutes(QUEUE_GRACE_MINUTES);
            }

            let elapsed = now - anchor;
            if elapsed <= budget {
                continue;
            }

            warn!(
                job_id = job.id,
                operation = %job.operation,
                elapsed_minutes = elapsed.num_minutes(),
                "job exceeded its execution budget"
            );
            metrics::counter!("jobs_timed_out_total").increment(1);
            for remote_id in &job.remote_job_ids {
                if let Err(err) = self.remote.cancel(remote_id).await {
                    debug!(remote_id, "cancel of timed-out chunk failed: {}", err);
                }
            }
            self.lifecycle
                .fail(
                    &job.id,
                    format!(
                        "execution timed out after {} minutes",
                        elapsed.num_minutes()
                    ),
                )
                .await?;
        }
        Ok(())
    }
}
