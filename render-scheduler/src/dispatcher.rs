//! The dispatch loop: admission control and remote submission.
//!
//! A single logical pass dequeues the first queued job that fits the
//! worker counter, reserves capacity, splits oversize `img2vid`
//! payloads into contiguous chunks, and submits them. Passes are
//! serialized by a non-reentrant flag; multi-process deployments are
//! fenced by the store's atomic `reserve`, not by this flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use render_common::health::Heartbeat;
use render_common::job::{Job, JobPatch, JobStatus};
use render_common::store::JobStore;

use crate::error::SchedulerError;
use crate::lifecycle::Lifecycle;
use crate::remote::{RemoteError, RemoteExecutor};

/// Consecutive local-pool skips tolerated before the pass throttles.
const VPS_SKIP_LIMIT: u32 = 3;
const VPS_SKIP_SLEEP: Duration = Duration::from_secs(2);

/// Cap on the per-job capacity backoff (1s, 2s, 3s, ...).
const BACKOFF_CAP_SECS: u64 = 5;

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteExecutor>,
    lifecycle: Arc<Lifecycle>,
    signal: Arc<Notify>,
    in_pass: AtomicBool,
    /// Capacity-backoff attempts keyed by job id.
    backoff: Mutex<HashMap<String, u64>>,
    vps_skips: AtomicU32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteExecutor>,
        lifecycle: Arc<Lifecycle>,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            remote,
            lifecycle,
            signal,
            in_pass: AtomicBool::new(false),
            backoff: Mutex::new(HashMap::new()),
            vps_skips: AtomicU32::new(0),
        }
    }

    /// Run until shutdown, passing on every tick and on every signal
    /// from enqueues and worker releases.
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
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        return;
                    }
                }
            }
            heartbeat.beat();
            if let Err(err) = self.pass().await {
                error!("dispatch pass failed: {}", err);
            }
        }
    }

    /// One dispatch pass. Re-entrant calls return immediately.
    pub async fn pass(&self) -> Result<(), SchedulerError> {
        if self
            .in_pass
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.pass_inner().await;
        self.in_pass.store(false, Ordering::SeqCst);
        result
    }

    async fn pass_inner(&self) -> Result<(), SchedulerError> {
        loop {
            if self.store.available().await? == 0 {
                return Ok(());
            }
            let Some(job) = self.store.dequeue_fittable().await? else {
                return Ok(());
            };

            if job.operation.local {
                // The local pool consumes these; hand the id back and
                // throttle once only local jobs keep surfacing.
                self.store.enqueue(&job.id).await?;
                let skips = self.vps_skips.fetch_add(1, Ordering::SeqCst) + 1;
                if skips >= VPS_SKIP_LIMIT {
                    self.vps_skips.store(0, Ordering::SeqCst);
                    tokio::time::sleep(VPS_SKIP_SLEEP).await;
                }
                self.signal.notify_one();
                return Ok(());
            }
            self.vps_skips.store(0, Ordering::SeqCst);

            let needed = job.workers_needed();
            let available = self.store.available().await?;
            if needed > available {
                // Not an error: the job stays queued until capacity
                // frees up, backing off so the pass is not hot.
                self.store.enqueue(&job.id).await?;
                self.signal.notify_one();
                let delay = self.next_backoff(&job.id);
                debug!(job_id = job.id, needed, available, "waiting for capacity");
                tokio::time::sleep(delay).await;
                return Ok(());
            }

            if !self.store.reserve(needed).await? {
                // Lost the race against another reserver.
                self.store.enqueue(&job.id).await?;
                self.signal.notify_one();
                return Ok(());
            }
            self.backoff.lock().unwrap().remove(&job.id);

            self.store
                .update(
                    &job.id,
                    JobPatch {
                        workers_reserved: Some(needed),
                        ..Default::default()
                    },
                )
                .await?;

            match self.submit_chunks(&job, needed).await {
                Ok(remote_job_ids) => {
                    info!(
                        job_id = job.id,
                        operation = %job.operation,
                        workers = needed,
                        chunks = remote_job_ids.len(),
                        "job submitted"
                    );
                    metrics::counter!("jobs_dispatched_total").increment(1);
                    self.store
                        .update(
                            &job.id,
                            JobPatch {
                                status: Some(JobStatus::Submitted),
                                submitted_at: Some(Utc::now()),
                                remote_job_ids: Some(remote_job_ids),
                                attempts: Some(job.attempts + 1),
                                ..Default::default()
                            },
                        )
                        .await?;
                    // The monitor drives completion from here; keep
                    // draining the queue.
                }
                Err((submitted, err)) => {
                    for remote_id in &submitted {
                        if let Err(cancel_err) = self.remote.cancel(remote_id).await {
                            debug!(
                                remote_id,
                                "cancel of partially submitted chunk failed: {}", cancel_err
                            );
                        }
                    }
                    metrics::counter!("jobs_submit_failed_total").increment(1);
                    self.lifecycle
                        .fail(&job.id, format!("submission failed: {err}"))
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Submit one payload per reserved worker, collecting handles in
    /// submission order. On failure the handles submitted so far are
    /// handed back for best-effort cancellation; the job is not
    /// retried.
    async fn submit_chunks(
        &self,
        job: &Job,
        workers: u32,
    ) -> Result<Vec<String>, (Vec<String>, RemoteError)> {
        let payloads = split_payload(&job.payload, workers);
        let mut remote_ids = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            match self.remote.submit(&job.operation, payload).await {
                Ok(remote_id) => remote_ids.push(remote_id),
                Err(err) => return Err((remote_ids, err)),
            }
        }
        Ok(remote_ids)
    }

    fn next_backoff(&self, job_id: &str) -> Duration {
        let mut backoff = self.backoff.lock().unwrap();
        let attempt = backoff.entry(job_id.to_owned()).or_insert(0);
        *attempt += 1;
        Duration::from_secs((*attempt).min(BACKOFF_CAP_SECS))
    }
}

/// Partition a payload into per-worker submissions.
///
/// This is the single place the scheduler looks inside a payload: the
/// `images` array is cut into contiguous chunks of `ceil(n / workers)`
/// and each chunk carries a `start_index` so the executor numbers its
/// outputs against the original array.
pub fn split_payload(payload: &Value, workers: u32) -> Vec<Value> {
    if workers <= 1 {
        return vec![payload.clone()];
    }

    let images = payload
        .get("images")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if images.is_empty() {
        return vec![payload.clone()];
    }

    let chunk_size = images.len().div_ceil(workers as usize);
    let mut chunks = Vec::with_capacity(workers as usize);
    let mut start = 0;
    while start < images.len() {
        let end = (start + chunk_size).min(images.len());
        let mut chunk = payload.clone();
        if let Some(object) = chunk.as_object_mut() {
            object.insert("images".to_owned(), Value::Array(images[start..end].to_vec()));
            object.insert("start_index".to_owned(), json!(start));
        }
        chunks.push(chunk);
        start = end;
    }
    chunks
}
