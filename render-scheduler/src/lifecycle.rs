//! Terminal transitions for jobs: completion, failure, cancellation.
//!
//! The ordering contract lives here and nowhere else: reserved
//! workers are released *before* the terminal status is written, and
//! the terminal write zeroes `workers_reserved` in the same patch. A
//! crash between the two steps leaves a terminal job with a non-zero
//! reservation; the reconciler detects that residue and zeroes it
//! without releasing again, because its correction is computed from
//! the counter itself.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use render_common::job::{Job, JobPatch, JobStatus, OperationKind};
use render_common::store::JobStore;

use crate::error::SchedulerError;
use crate::notifier::WebhookNotifier;
use crate::remote::RemoteExecutor;

static VIDEO_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"video_(\d+)\.mp4").expect("invalid video filename pattern"));

/// Shared terminal-transition path used by the dispatcher, the
/// monitor, the local pool and the job service.
pub struct Lifecycle {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteExecutor>,
    notifier: Arc<WebhookNotifier>,
    dispatch_signal: Arc<Notify>,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteExecutor>,
        notifier: Arc<WebhookNotifier>,
        dispatch_signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            remote,
            notifier,
            dispatch_signal,
        }
    }

    /// Mark a job COMPLETED with the aggregated executor outputs.
    pub async fn complete(&self, job_id: &str, outputs: Vec<Value>) -> Result<(), SchedulerError> {
        let Some(current) = self.store.get(job_id).await? else {
            return Err(SchedulerError::JobNotFound(job_id.to_owned()));
        };
        if current.status.is_terminal() {
            debug!(job_id, "completion ignored, job already terminal");
            return Ok(());
        }

        let result = aggregate_outputs(&current, &outputs);
        self.release_reserved(&current).await?;

        let updated = self
            .store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    result: Some(result),
                    completed_at: Some(Utc::now()),
                    workers_reserved: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        info!(job_id, operation = %updated.operation, "job completed");
        metrics::counter!("jobs_completed_total").increment(1);
        record_turnaround(&updated);
        self.notifier.dispatch(&updated);
        Ok(())
    }

    /// Mark a job FAILED. Used for submission failures, executor
    /// failures, timeouts and orphaned remote jobs alike; the reason
    /// string tells them apart.
    pub async fn fail(&self, job_id: &str, error: String) -> Result<(), SchedulerError> {
        let Some(current) = self.store.get(job_id).await? else {
            return Err(SchedulerError::JobNotFound(job_id.to_owned()));
        };
        if current.status.is_terminal() {
            debug!(job_id, "failure ignored, job already terminal");
            return Ok(());
        }

        self.release_reserved(&current).await?;

        let updated = self
            .store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error: Some(error.clone()),
                    completed_at: Some(Utc::now()),
                    workers_reserved: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        warn!(job_id, operation = %updated.operation, error, "job failed");
        metrics::counter!("jobs_failed_total").increment(1);
        record_turnaround(&updated);
        self.notifier.dispatch(&updated);
        Ok(())
    }

    /// User-driven cancellation. Rejected for terminal jobs. For
    /// submitted or processing jobs the remote cancels are fired
    /// best-effort and are in flight when this returns.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let Some(current) = self.store.get(job_id).await? else {
            return Err(SchedulerError::JobNotFound(job_id.to_owned()));
        };
        if current.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(job_id.to_owned()));
        }

        if current.status.is_active() {
            self.spawn_remote_cancels(current.remote_job_ids.clone());
        }
        self.release_reserved(&current).await?;

        let updated = self
            .store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    workers_reserved: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        info!(job_id, operation = %updated.operation, "job cancelled");
        metrics::counter!("jobs_cancelled_total").increment(1);
        self.notifier.dispatch(&updated);
        Ok(updated)
    }

    /// Credit the counter back and wake the dispatcher. Writing the
    /// release before the signal makes the freed workers observable to
    /// the very next pass.
    async fn release_reserved(&self, job: &Job) -> Result<(), SchedulerError> {
        if job.workers_reserved > 0 {
            self.store.release(job.workers_reserved).await?;
            self.dispatch_signal.notify_one();
        }
        Ok(())
    }

    /// Fire-and-forget cancel requests for remote sub-jobs.
    pub fn spawn_remote_cancels(&self, remote_ids: Vec<String>) {
        for remote_id in remote_ids {
            let remote = self.remote.clone();
            tokio::spawn(async move {
                if let Err(err) = remote.cancel(&remote_id).await {
                    warn!(remote_id, "best-effort remote cancel failed: {}", err);
                }
            });
        }
    }

}

/// Enqueue-to-terminal latency, labelled by operation tag.
fn record_turnaround(job: &Job) {
    let done = job.completed_at.unwrap_or_else(Utc::now);
    let seconds = (done - job.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    metrics::histogram!("job_turnaround_seconds", "operation" => job.operation.to_string())
        .record(seconds);
}

/// Merge executor outputs into the job result.
///
/// Multi-chunk `img2vid` jobs flatten every chunk's `videos` array and
/// sort by the numeric suffix of each entry's filename so outputs
/// arrive in frame order regardless of which chunk finished first.
/// Single submissions pass the executor output through verbatim.
pub fn aggregate_outputs(job: &Job, outputs: &[Value]) -> Value {
    if job.operation.kind == OperationKind::Img2Vid && outputs.len() > 1 {
        let mut videos: Vec<Value> = outputs
            .iter()
            .flat_map(|output| {
                output
                    .get("videos")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        videos.sort_by_key(video_index);

        return json!({
            "code": 200,
            "message": format!("{} videos processed successfully", videos.len()),
            "videos": videos,
        });
    }
    outputs.first().cloned().unwrap_or(Value::Null)
}

fn video_index(entry: &Value) -> u64 {
    entry
        .get("filename")
        .and_then(Value::as_str)
        .and_then(|filename| VIDEO_SUFFIX.captures(filename))
        .and_then(|captures| captures[1].parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use render_common::job::JobDraft;
    use render_common::store::{JobStore, MemoryJobStore};
    use serde_json::json;

    use crate::remote::MockRemoteExecutor;

    const MAX_WORKERS: u32 = 3;

    struct Fixture {
        store: Arc<MemoryJobStore>,
        remote: Arc<MockRemoteExecutor>,
        lifecycle: Lifecycle,
        signal: Arc<Notify>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        let remote = Arc::new(MockRemoteExecutor::new());
        let notifier = Arc::new(
            WebhookNotifier::new(store.clone(), None, 0, Duration::from_secs(1))
                .with_retry_delays(vec![Duration::from_millis(1)]),
        );
        let signal = Arc::new(Notify::new());
        let lifecycle = Lifecycle::new(
            store.clone(),
            remote.clone(),
            notifier,
            signal.clone(),
        );
        Fixture {
            store,
            remote,
            lifecycle,
            signal,
        }
    }

    async fn submitted_job(fixture: &Fixture, reserved: u32) -> Job {
        let job = fixture
            .store
            .create(JobDraft {
                operation: "img2vid".parse().unwrap(),
                payload: json!({"images": ["a.png"]}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();
        assert!(fixture.store.reserve(reserved).await.unwrap());
        fixture
            .store
            .update(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Submitted),
                    workers_reserved: Some(reserved),
                    remote_job_ids: Some(vec!["remote-0".to_owned()]),
                    submitted_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_complete_releases_and_zeroes_reservation() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 2).await;
        assert_eq!(fixture.store.available().await.unwrap(), 1);

        fixture
            .lifecycle
            .complete(&job.id, vec![json!({"code": 200})])
            .await
            .unwrap();

        let updated = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.workers_reserved, 0);
        assert!(updated.completed_at.is_some());
        assert_eq!(fixture.store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 2).await;
        // A bystander holds one worker so clamping cannot mask a
        // double release.
        assert!(fixture.store.reserve(1).await.unwrap());

        fixture
            .lifecycle
            .complete(&job.id, vec![json!({})])
            .await
            .unwrap();
        fixture
            .lifecycle
            .complete(&job.id, vec![json!({})])
            .await
            .unwrap();

        assert_eq!(fixture.store.available().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fail_sets_error_and_releases() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 1).await;

        fixture
            .lifecycle
            .fail(&job.id, "executor reported FAILED".to_owned())
            .await
            .unwrap();

        let updated = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.error.as_deref(), Some("executor reported FAILED"));
        assert_eq!(updated.workers_reserved, 0);
        assert_eq!(fixture.store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_release_signals_dispatcher() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 1).await;

        let signal = fixture.signal.clone();
        let waiter = tokio::spawn(async move { signal.notified().await });

        fixture.lifecycle.complete(&job.id, vec![json!({})]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dispatcher was not signalled after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_job_skips_remote() {
        let fixture = fixture().await;
        let job = fixture
            .store
            .create(JobDraft {
                operation: "caption".parse().unwrap(),
                payload: json!({}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();

        let cancelled = fixture.lifecycle.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(fixture.remote.cancelled().is_empty());
        assert_eq!(fixture.store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_cancel_active_job_fires_remote_cancels() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 1).await;

        fixture.lifecycle.cancel(&job.id).await.unwrap();
        // Cancels are in flight, not awaited; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.remote.cancelled(), vec!["remote-0".to_owned()]);
        assert_eq!(fixture.store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_rejected() {
        let fixture = fixture().await;
        let job = submitted_job(&fixture, 1).await;
        fixture.lifecycle.complete(&job.id, vec![json!({})]).await.unwrap();

        let result = fixture.lifecycle.cancel(&job.id).await;
        assert!(matches!(result, Err(SchedulerError::AlreadyTerminal(_))));
        // Terminal state is never left.
        let current = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Completed);
    }

    #[test]
    fn test_aggregate_single_chunk_verbatim() {
        let job = Job {
            id: "j".to_owned(),
            operation: "img2vid".parse().unwrap(),
            payload: json!({}),
            webhook_url: String::new(),
            correlation_id: None,
            path_root: None,
            status: JobStatus::Processing,
            remote_job_ids: vec!["remote-0".to_owned()],
            workers_reserved: 1,
            result: None,
            error: None,
            created_at: Utc::now(),
            submitted_at: None,
            processing_started_at: None,
            completed_at: None,
            retry_count: 0,
            attempts: 0,
        };
        let output = json!({"code": 200, "videos": [{"filename": "video_0.mp4"}]});
        assert_eq!(aggregate_outputs(&job, &[output.clone()]), output);
    }

    #[test]
    fn test_aggregate_multi_chunk_sorts_by_suffix() {
        let job = Job {
            id: "j".to_owned(),
            operation: "img2vid".parse().unwrap(),
            payload: json!({}),
            webhook_url: String::new(),
            correlation_id: None,
            path_root: None,
            status: JobStatus::Processing,
            remote_job_ids: vec!["remote-0".to_owned(), "remote-1".to_owned()],
            workers_reserved: 2,
            result: None,
            error: None,
            created_at: Utc::now(),
            submitted_at: None,
            processing_started_at: None,
            completed_at: None,
            retry_count: 0,
            attempts: 0,
        };

        // The second chunk finished first and holds the earlier
        // frames' outputs out of order.
        let chunk_a = json!({"videos": [
            {"filename": "video_30.mp4"},
            {"filename": "video_31.mp4"},
        ]});
        let chunk_b = json!({"videos": [
            {"filename": "video_1.mp4"},
            {"filename": "video_0.mp4"},
        ]});

        let merged = aggregate_outputs(&job, &[chunk_a, chunk_b]);
        assert_eq!(merged["code"], 200);
        assert_eq!(merged["message"], "4 videos processed successfully");
        let names: Vec<&str> = merged["videos"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["filename"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["video_0.mp4", "video_1.mp4", "video_30.mp4", "video_31.mp4"]
        );
    }
}
