//! The local CPU worker pool.
//!
//! Pulls `_vps` jobs from the shared queue, bounded by its own
//! semaphore; it never touches the remote worker counter. The media
//! work itself is out of scope and sits behind the `MediaProcessor`
//! seam: the shipped implementation hands the payload to a configured
//! external program and reads the result back as JSON.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use render_common::health::Heartbeat;
use render_common::job::{Job, JobPatch, JobStatus};
use render_common::store::JobStore;

use crate::error::SchedulerError;
use crate::lifecycle::Lifecycle;

/// Consecutive remote-job skips tolerated before the pool throttles,
/// mirroring the dispatcher's local-job skip.
const SKIP_LIMIT: u32 = 3;
const SKIP_SLEEP: Duration = Duration::from_secs(2);

/// Enumeration of errors from executing a local media operation.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch media processor: {0}")]
    Spawn(std::io::Error),
    #[error("media processor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("media processor produced invalid output: {0}")]
    InvalidOutput(serde_json::Error),
    #[error("io error talking to media processor: {0}")]
    Io(std::io::Error),
}

/// Seam for the external media subsystem executing one local job.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<Value, ProcessError>;
}

/// Runs a configured executable per job: operation tag as the first
/// argument, payload JSON on stdin, result JSON expected on stdout.
pub struct CommandProcessor {
    program: String,
}

impl CommandProcessor {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_owned(),
        }
    }
}

#[async_trait]
impl MediaProcessor for CommandProcessor {
    async fn process(&self, job: &Job) -> Result<Value, ProcessError> {
        let mut child = Command::new(&self.program)
            .arg(job.operation.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProcessError::Spawn)?;

        let payload =
            serde_json::to_vec(&job.payload).map_err(ProcessError::InvalidOutput)?;
        if let Some(mut stdin) = child.stdin.take() {
            // The processor may exit before draining stdin; its exit
            // status is what decides success.
            if let Err(err) = stdin.write_all(&payload).await {
                debug!("media processor closed stdin early: {}", err);
            }
        }

        let output = child.wait_with_output().await.map_err(ProcessError::Io)?;
        if !output.status.success() {
            return Err(ProcessError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(ProcessError::InvalidOutput)
    }
}

pub struct LocalWorkerPool {
    store: Arc<dyn JobStore>,
    lifecycle: Arc<Lifecycle>,
    processor: Arc<dyn MediaProcessor>,
    slots: Arc<Semaphore>,
    /// Woken on enqueue and on slot release.
    signal: Arc<Notify>,
    /// Nudged when a remote job is handed back to the dispatcher.
    dispatch_signal: Arc<Notify>,
    skips: AtomicU32,
}

impl LocalWorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        lifecycle: Arc<Lifecycle>,
        processor: Arc<dyn MediaProcessor>,
        max_concurrency: usize,
        signal: Arc<Notify>,
        dispatch_signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            processor,
            slots: Arc::new(Semaphore::new(max_concurrency)),
            signal,
            dispatch_signal,
            skips: AtomicU32::new(0),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
        tick: Duration,
    ) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.signal.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("local pool shutting down");
                        return;
                    }
                }
            }
            heartbeat.beat();
            if let Err(err) = self.step().await {
                error!("local pool step failed: {}", err);
            }
        }
    }

    /// Drain the queue of local jobs until it yields nothing, blocking
    /// on a slot when the pool is saturated.
    pub async fn step(self: &Arc<Self>) -> Result<(), SchedulerError> {
        loop {
            let Some(job) = self.store.dequeue_front().await? else {
                return Ok(());
            };

            if !job.operation.local {
                // Remote job: hand it back to the dispatcher.
                self.store.enqueue(&job.id).await?;
                self.dispatch_signal.notify_one();
                let skips = self.skips.fetch_add(1, Ordering::SeqCst) + 1;
                if skips >= SKIP_LIMIT {
                    self.skips.store(0, Ordering::SeqCst);
                    tokio::time::sleep(SKIP_SLEEP).await;
                }
                return Ok(());
            }
            self.skips.store(0, Ordering::SeqCst);

            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .expect("local pool semaphore closed");

            // Local jobs skip SUBMITTED: there is no remote handoff.
            let job = self
                .store
                .update(
                    &job.id,
                    JobPatch {
                        status: Some(JobStatus::Processing),
                        processing_started_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            info!(job_id = job.id, operation = %job.operation, "local job processing");

            let pool = self.clone();
            tokio::spawn(async move {
                let outcome = pool.processor.process(&job).await;
                drop(permit);
                pool.signal.notify_one();

                let result = match outcome {
                    Ok(output) => pool.lifecycle.complete(&job.id, vec![output]).await,
                    Err(err) => pool.lifecycle.fail(&job.id, err.to_string()).await,
                };
                if let Err(err) = result {
                    warn!(job_id = job.id, "local completion handling failed: {}", err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use render_common::job::JobDraft;
    use render_common::store::MemoryJobStore;
    use serde_json::json;

    use crate::notifier::WebhookNotifier;
    use crate::remote::MockRemoteExecutor;

    struct MockProcessor {
        delay: Duration,
        fail_with: Option<String>,
        running: AtomicU32,
        peak: AtomicU32,
        processed: Mutex<Vec<String>>,
    }

    impl MockProcessor {
        fn new() -> Self {
            Self {
                delay: Duration::from_millis(0),
                fail_with: None,
                running: AtomicU32::new(0),
                peak: AtomicU32::new(0),
                processed: Mutex::new(Vec::new()),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, message: &str) -> Self {
            self.fail_with = Some(message.to_owned());
            self
        }
    }

    #[async_trait]
    impl MediaProcessor for MockProcessor {
        async fn process(&self, job: &Job) -> Result<Value, ProcessError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.processed.lock().unwrap().push(job.id.clone());

            match &self.fail_with {
                Some(message) => Err(ProcessError::Failed {
                    status: "exit status: 1".to_owned(),
                    stderr: message.clone(),
                }),
                None => Ok(json!({"code": 200, "operation": job.operation.to_string()})),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryJobStore>,
        pool: Arc<LocalWorkerPool>,
        processor: Arc<MockProcessor>,
    }

    fn fixture(processor: MockProcessor, max_concurrency: usize) -> Fixture {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(3, 86400));
        let remote = Arc::new(MockRemoteExecutor::new());
        let notifier = Arc::new(
            WebhookNotifier::new(store.clone(), None, 0, Duration::from_secs(1))
                .with_retry_delays(vec![Duration::from_millis(1)]),
        );
        let dispatch_signal = Arc::new(Notify::new());
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            remote,
            notifier,
            dispatch_signal.clone(),
        ));
        let processor = Arc::new(processor);
        let pool = Arc::new(LocalWorkerPool::new(
            store.clone(),
            lifecycle,
            processor.clone(),
            max_concurrency,
            Arc::new(Notify::new()),
            dispatch_signal,
        ));
        Fixture {
            store,
            pool,
            processor,
        }
    }

    async fn enqueue_job(fixture: &Fixture, operation: &str) -> Job {
        let job = fixture
            .store
            .create(JobDraft {
                operation: operation.parse().unwrap(),
                payload: json!({"text": "hello"}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();
        fixture.store.enqueue(&job.id).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_local_job_runs_to_completion() {
        let fixture = fixture(MockProcessor::new(), 2);
        let job = enqueue_job(&fixture, "caption_vps").await;

        fixture.pool.step().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let updated = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert!(updated.processing_started_at.is_some());
        assert!(updated.result.is_some());
        // Local jobs never carry remote handles or reservations.
        assert!(updated.remote_job_ids.is_empty());
        assert_eq!(updated.workers_reserved, 0);
        assert_eq!(fixture.store.available().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_processing_marks_job_failed() {
        let fixture = fixture(MockProcessor::new().failing("ffmpeg blew up"), 2);
        let job = enqueue_job(&fixture, "addaudio_vps").await;

        fixture.pool.step().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let updated = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert!(updated.error.as_deref().unwrap().contains("ffmpeg blew up"));
    }

    #[tokio::test]
    async fn test_remote_jobs_are_handed_back() {
        let fixture = fixture(MockProcessor::new(), 2);
        let job = enqueue_job(&fixture, "caption").await;

        fixture.pool.step().await.unwrap();

        let updated = fixture.store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(fixture.store.queue_depth().await.unwrap(), 1);
        assert!(fixture.processor.processed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_the_pool_limit() {
        let fixture = fixture(MockProcessor::new().slow(Duration::from_millis(80)), 2);
        for _ in 0..4 {
            enqueue_job(&fixture, "caption_vps").await;
        }

        fixture.pool.step().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(fixture.processor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.processor.processed.lock().unwrap().len(), 4);
        for job in fixture.store.all_jobs().await.unwrap() {
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_command_processor_round_trips_payload() {
        let processor = CommandProcessor::new("cat");
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(3, 86400));
        let job = store
            .create(JobDraft {
                operation: "transcribe_vps".parse().unwrap(),
                payload: json!({"audio": "take1.wav", "language": "pt"}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();

        // `cat` echoes the payload back, standing in for a processor
        // that answers with JSON on stdout.
        let output = processor.process(&job).await.unwrap();
        assert_eq!(output, job.payload);
    }

    #[tokio::test]
    async fn test_command_processor_surfaces_nonzero_exit() {
        let processor = CommandProcessor::new("false");
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(3, 86400));
        let job = store
            .create(JobDraft {
                operation: "caption_vps".parse().unwrap(),
                payload: json!({}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();

        let result = processor.process(&job).await;
        assert!(matches!(result, Err(ProcessError::Failed { .. })));
    }
}
