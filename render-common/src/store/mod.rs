//! # Job store
//!
//! A persistent job store with a pending queue and the global remote
//! worker counter. Two implementations share one contract: an
//! in-process store for single-node deployments and tests, and a
//! Redis-backed store for restart-safe deployments. All counter and
//! queue access goes through this interface; nothing else in the
//! system touches the shared state directly.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::Serialize;
use thiserror::Error;

use crate::job::{Job, JobDraft, JobPatch, JobStatus};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

/// Enumeration of errors for operations on a job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: ::redis::RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: ::redis::RedisError,
    },
    #[error("failed to encode job {id}: {error}")]
    EncodeError {
        id: String,
        error: serde_json::Error,
    },
    #[error("failed to decode job record: {error}")]
    DecodeError { error: serde_json::Error },
    #[error("job {0} does not exist")]
    JobNotFound(String),
    #[error("{0} is not a valid queue storage kind")]
    ParseStorageKindError(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Population counts by status plus the worker counters, as returned
/// by `JobStore::stats` and served on `GET /queue/stats`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub submitted: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
    pub available_workers: u32,
    pub max_workers: u32,
}

/// Contract shared by every store flavor.
///
/// The head-of-line-skip dequeue is part of this interface rather than
/// a caller-side filter so the scan can be made atomic per
/// implementation: a smaller job may overtake a larger queue head that
/// does not fit the current counter.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Assign an id and `created_at`, persist with status QUEUED, and
    /// return the full job. Does not enqueue.
    async fn create(&self, draft: JobDraft) -> StoreResult<Job>;

    async fn get(&self, id: &str) -> StoreResult<Option<Job>>;

    /// Apply a partial overwrite. On a transition to a terminal status
    /// the record's retention TTL starts. The store never vetoes an
    /// update; callers enforce the status transition rules.
    async fn update(&self, id: &str, patch: JobPatch) -> StoreResult<Job>;

    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Append to the pending queue. A no-op when the id is already
    /// queued.
    async fn enqueue(&self, id: &str) -> StoreResult<()>;

    /// Scan the queue in order and pop the first job whose computed
    /// reservation fits the current counter. Stale entries (job gone
    /// or no longer QUEUED) are removed during the scan. Returns
    /// `None`, leaving the queue intact, when nothing fits.
    async fn dequeue_fittable(&self) -> StoreResult<Option<Job>>;

    /// Plain FIFO pop for the local pool, which competes on its own
    /// concurrency limit rather than the worker counter. Stale entries
    /// are dropped the same way as in `dequeue_fittable`.
    async fn dequeue_front(&self) -> StoreResult<Option<Job>>;

    /// Atomic check-and-decrement of the worker counter. Returns false
    /// and leaves the counter unchanged when fewer than `count`
    /// workers are available.
    async fn reserve(&self, count: u32) -> StoreResult<bool>;

    /// Atomic increment, clamped at the fleet maximum. Over-release is
    /// logged and capped, not fatal. Returns the counter after the
    /// release.
    async fn release(&self, count: u32) -> StoreResult<u32>;

    /// Sentinel write used only by the reconciler.
    async fn set_available(&self, count: u32) -> StoreResult<()>;

    async fn available(&self) -> StoreResult<u32>;

    async fn by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>>;

    /// Jobs in SUBMITTED or PROCESSING.
    async fn active(&self) -> StoreResult<Vec<Job>>;

    /// Ids currently in the pending queue, in queue order.
    async fn queued_ids(&self) -> StoreResult<Vec<String>>;

    /// Zero-based position of the id in the pending queue.
    async fn queue_position(&self, id: &str) -> StoreResult<Option<usize>>;

    async fn queue_depth(&self) -> StoreResult<usize>;

    /// Every job currently persisted, used by the reconciler audit.
    async fn all_jobs(&self) -> StoreResult<Vec<Job>>;

    async fn stats(&self) -> StoreResult<QueueStats>;

    /// Drop terminal jobs whose retention TTL has lapsed. The Redis
    /// flavor relies on key TTLs and reports zero.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Which store flavor to construct, parsed from `QUEUE_STORAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Redis,
}

impl FromStr for StorageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MEMORY" => Ok(StorageKind::Memory),
            "REDIS" => Ok(StorageKind::Redis),
            invalid => Err(StoreError::ParseStorageKindError(invalid.to_owned())),
        }
    }
}

/// Construct the store flavor selected by configuration.
///
/// In-memory suffices for a single process; Redis is required as soon
/// as state must survive restarts or be shared between processes.
pub async fn build_store(
    kind: StorageKind,
    redis_url: &str,
    max_workers: u32,
    job_ttl_seconds: u64,
) -> StoreResult<Arc<dyn JobStore>> {
    match kind {
        StorageKind::Memory => Ok(Arc::new(MemoryJobStore::new(
            max_workers,
            job_ttl_seconds,
        ))),
        StorageKind::Redis => Ok(Arc::new(
            RedisJobStore::new(redis_url, max_workers, job_ttl_seconds).await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!("MEMORY".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert_eq!("redis".parse::<StorageKind>().unwrap(), StorageKind::Redis);
        assert!("postgres".parse::<StorageKind>().is_err());
    }
}
