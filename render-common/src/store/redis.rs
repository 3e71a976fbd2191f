//! Redis-backed store flavor for restart-safe and multi-process
//! deployments.
//!
//! Key layout:
//! - `orchestrator:jobs:<id>` — serialized job record, 24h TTL once
//!   terminal
//! - `orchestrator:queue:pending` — list of queued ids
//! - `orchestrator:workers:available` — the worker counter, mutated
//!   with INCRBY/DECRBY
//!
//! The counter is the only cross-process synchronization point:
//! `reserve` is decrement-then-verify with a compensating increment on
//! underflow. Queue scans and record read-modify-writes are serialized
//! per process by an internal mutex; concurrent dispatchers in other
//! processes are fenced by `reserve`, not by the scan.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::job::{Job, JobDraft, JobPatch, JobStatus};
use crate::store::{JobStore, QueueStats, StoreError, StoreResult};

const JOB_KEY_PREFIX: &str = "orchestrator:jobs:";
const QUEUE_KEY: &str = "orchestrator:queue:pending";
const WORKERS_KEY: &str = "orchestrator:workers:available";

fn job_key(id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

fn command_error(command: &str) -> impl FnOnce(redis::RedisError) -> StoreError + '_ {
    move |error| StoreError::CommandError {
        command: command.to_owned(),
        error,
    }
}

pub struct RedisJobStore {
    connection: MultiplexedConnection,
    max_workers: u32,
    job_ttl_seconds: u64,
    /// Serializes queue scans and record read-modify-writes within
    /// this process.
    scan_lock: Mutex<()>,
}

impl RedisJobStore {
    pub async fn new(
        url: &str,
        max_workers: u32,
        job_ttl_seconds: u64,
    ) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|error| StoreError::ConnectionError { error })?;
        let mut connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        // Seed the counter on first boot only; a restart keeps the
        // live value and lets the reconciler audit it.
        let _: bool = connection
            .set_nx(WORKERS_KEY, max_workers as i64)
            .await
            .map_err(command_error("SETNX"))?;

        Ok(Self {
            connection,
            max_workers,
            job_ttl_seconds,
            scan_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    async fn read_job(&self, id: &str) -> StoreResult<Option<Job>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(job_key(id)).await.map_err(command_error("GET"))?;
        match raw {
            Some(raw) => {
                let job = serde_json::from_str(&raw)
                    .map_err(|error| StoreError::DecodeError { error })?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn write_job(&self, job: &Job) -> StoreResult<()> {
        let raw = serde_json::to_string(job).map_err(|error| StoreError::EncodeError {
            id: job.id.clone(),
            error,
        })?;
        let mut conn = self.conn();
        let key = job_key(&job.id);
        let _: () = conn.set(&key, raw).await.map_err(command_error("SET"))?;
        if job.status.is_terminal() {
            let _: bool = conn
                .expire(&key, self.job_ttl_seconds as usize)
                .await
                .map_err(command_error("EXPIRE"))?;
        }
        Ok(())
    }

    async fn remove_from_queue(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn
            .lrem(QUEUE_KEY, 1, id)
            .await
            .map_err(command_error("LREM"))?;
        Ok(())
    }

    async fn job_keys(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(format!("{JOB_KEY_PREFIX}*"))
            .await
            .map_err(command_error("SCAN"))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Shared scan behind `dequeue_fittable` and `dequeue_front`.
    async fn scan_queue<F>(&self, fits: F) -> StoreResult<Option<Job>>
    where
        F: Fn(&Job, u32) -> bool,
    {
        let _guard = self.scan_lock.lock().await;
        let mut conn = self.conn();
        let queued: Vec<String> = conn
            .lrange(QUEUE_KEY, 0, -1)
            .await
            .map_err(command_error("LRANGE"))?;
        let available = self.available().await?;

        for id in queued {
            match self.read_job(&id).await? {
                Some(job) if job.status == JobStatus::Queued => {
                    if fits(&job, available) {
                        self.remove_from_queue(&id).await?;
                        return Ok(Some(job));
                    }
                }
                _ => {
                    // Stale id: job expired, deleted, or no longer
                    // QUEUED.
                    self.remove_from_queue(&id).await?;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, draft: JobDraft) -> StoreResult<Job> {
        let job = Job {
            id: Uuid::now_v7().to_string(),
            operation: draft.operation,
            payload: draft.payload,
            webhook_url: draft.webhook_url,
            correlation_id: draft.correlation_id,
            path_root: draft.path_root,
            status: JobStatus::Queued,
            remote_job_ids: Vec::new(),
            workers_reserved: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            submitted_at: None,
            processing_started_at: None,
            completed_at: None,
            retry_count: 0,
            attempts: 0,
        };
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        self.read_job(id).await
    }

    async fn update(&self, id: &str, patch: JobPatch) -> StoreResult<Job> {
        let _guard = self.scan_lock.lock().await;
        let mut job = self
            .read_job(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_owned()))?;
        patch.apply(&mut job);
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(job_key(id)).await.map_err(command_error("DEL"))?;
        self.remove_from_queue(id).await
    }

    async fn enqueue(&self, id: &str) -> StoreResult<()> {
        let _guard = self.scan_lock.lock().await;
        let mut conn = self.conn();
        let queued: Vec<String> = conn
            .lrange(QUEUE_KEY, 0, -1)
            .await
            .map_err(command_error("LRANGE"))?;
        if !queued.iter().any(|queued_id| queued_id == id) {
            let _: i64 = conn
                .rpush(QUEUE_KEY, id)
                .await
                .map_err(command_error("RPUSH"))?;
        }
        Ok(())
    }

    async fn dequeue_fittable(&self) -> StoreResult<Option<Job>> {
        self.scan_queue(|job, available| job.workers_needed() <= available)
            .await
    }

    async fn dequeue_front(&self) -> StoreResult<Option<Job>> {
        self.scan_queue(|_, _| true).await
    }

    async fn reserve(&self, count: u32) -> StoreResult<bool> {
        let mut conn = self.conn();
        let after: i64 = conn
            .decr(WORKERS_KEY, count as i64)
            .await
            .map_err(command_error("DECRBY"))?;
        if after < 0 {
            // Underflow: compensate and report no capacity.
            let _: i64 = conn
                .incr(WORKERS_KEY, count as i64)
                .await
                .map_err(command_error("INCRBY"))?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn release(&self, count: u32) -> StoreResult<u32> {
        let mut conn = self.conn();
        let after: i64 = conn
            .incr(WORKERS_KEY, count as i64)
            .await
            .map_err(command_error("INCRBY"))?;
        if after > self.max_workers as i64 {
            warn!(
                released = count,
                counter = after,
                max = self.max_workers,
                "worker over-release, clamping counter to fleet maximum"
            );
            let _: () = conn
                .set(WORKERS_KEY, self.max_workers as i64)
                .await
                .map_err(command_error("SET"))?;
            return Ok(self.max_workers);
        }
        Ok(after as u32)
    }

    async fn set_available(&self, count: u32) -> StoreResult<()> {
        let mut conn = self.conn();
        let clamped = count.min(self.max_workers);
        let _: () = conn
            .set(WORKERS_KEY, clamped as i64)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn available(&self) -> StoreResult<u32> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(WORKERS_KEY).await.map_err(command_error("GET"))?;
        Ok(value.unwrap_or(0).clamp(0, self.max_workers as i64) as u32)
    }

    async fn by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let jobs = self.all_jobs().await?;
        Ok(jobs.into_iter().filter(|job| job.status == status).collect())
    }

    async fn active(&self) -> StoreResult<Vec<Job>> {
        let jobs = self.all_jobs().await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.status.is_active())
            .collect())
    }

    async fn queued_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.lrange(QUEUE_KEY, 0, -1)
            .await
            .map_err(command_error("LRANGE"))
    }

    async fn queue_position(&self, id: &str) -> StoreResult<Option<usize>> {
        let queued = self.queued_ids().await?;
        Ok(queued.iter().position(|queued_id| queued_id == id))
    }

    async fn queue_depth(&self) -> StoreResult<usize> {
        let mut conn = self.conn();
        let depth: i64 = conn.llen(QUEUE_KEY).await.map_err(command_error("LLEN"))?;
        Ok(depth as usize)
    }

    async fn all_jobs(&self) -> StoreResult<Vec<Job>> {
        let keys = self.job_keys().await?;
        let mut jobs = Vec::with_capacity(keys.len());
        let mut conn = self.conn();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.map_err(command_error("GET"))?;
            // A key may expire between SCAN and GET.
            if let Some(raw) = raw {
                let job = serde_json::from_str(&raw)
                    .map_err(|error| StoreError::DecodeError { error })?;
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let mut stats = QueueStats {
            queue_depth: self.queue_depth().await?,
            available_workers: self.available().await?,
            max_workers: self.max_workers,
            ..Default::default()
        };
        for job in self.all_jobs().await? {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Submitted => stats.submitted += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        // Retention is the key TTL set on terminal transition.
        Ok(0)
    }
}
