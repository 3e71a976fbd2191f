//! In-process store flavor. A single async mutex over plain
//! collections makes every operation, including the dequeue scan,
//! atomic by construction. Sufficient for single-node deployments and
//! the test suite.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::job::{Job, JobDraft, JobPatch, JobStatus};
use crate::store::{JobStore, QueueStats, StoreError, StoreResult};

struct Inner {
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
    available: u32,
}

pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    max_workers: u32,
    job_ttl: Duration,
}

impl MemoryJobStore {
    pub fn new(max_workers: u32, job_ttl_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                available: max_workers,
            }),
            max_workers,
            job_ttl: Duration::seconds(job_ttl_seconds as i64),
        }
    }

    /// Pop the first queued job accepted by `fits`, dropping stale
    /// entries encountered on the way.
    fn scan_queue<F>(inner: &mut Inner, fits: F) -> Option<Job>
    where
        F: Fn(&Job, u32) -> bool,
    {
        let mut index = 0;
        while index < inner.queue.len() {
            let id = inner.queue[index].clone();
            match inner.jobs.get(&id) {
                Some(job) if job.status == JobStatus::Queued => {
                    if fits(job, inner.available) {
                        let job = job.clone();
                        inner.queue.remove(index);
                        return Some(job);
                    }
                    index += 1;
                }
                _ => {
                    // Stale id: job deleted or no longer QUEUED.
                    inner.queue.remove(index);
                }
            }
        }
        None
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
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

        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: JobPatch) -> StoreResult<Job> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_owned()))?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(id);
        inner.queue.retain(|queued| queued != id);
        Ok(())
    }

    async fn enqueue(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.queue.iter().any(|queued| queued == id) {
            inner.queue.push_back(id.to_owned());
        }
        Ok(())
    }

    async fn dequeue_fittable(&self) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        Ok(Self::scan_queue(&mut inner, |job, available| {
            job.workers_needed() <= available
        }))
    }

    async fn dequeue_front(&self) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        Ok(Self::scan_queue(&mut inner, |_, _| true))
    }

    async fn reserve(&self, count: u32) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if count <= inner.available {
            inner.available -= count;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, count: u32) -> StoreResult<u32> {
        let mut inner = self.inner.lock().await;
        let raised = inner.available.saturating_add(count);
        if raised > self.max_workers {
            warn!(
                released = count,
                counter = inner.available,
                max = self.max_workers,
                "worker over-release, clamping counter to fleet maximum"
            );
            inner.available = self.max_workers;
        } else {
            inner.available = raised;
        }
        Ok(inner.available)
    }

    async fn set_available(&self, count: u32) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.available = count.min(self.max_workers);
        Ok(())
    }

    async fn available(&self) -> StoreResult<u32> {
        let inner = self.inner.lock().await;
        Ok(inner.available)
    }

    async fn by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn active(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.status.is_active())
            .cloned()
            .collect())
    }

    async fn queued_ids(&self) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.iter().cloned().collect())
    }

    async fn queue_position(&self, id: &str) -> StoreResult<Option<usize>> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.iter().position(|queued| queued == id))
    }

    async fn queue_depth(&self) -> StoreResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.len())
    }

    async fn all_jobs(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.values().cloned().collect())
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            queue_depth: inner.queue.len(),
            available_workers: inner.available,
            max_workers: self.max_workers,
            ..Default::default()
        };
        for job in inner.jobs.values() {
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
        let cutoff = Utc::now() - self.job_ttl;
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job.completed_at.is_some_and(|done| done < cutoff)
            })
            .map(|job| job.id.clone())
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(operation: &str, payload: serde_json::Value) -> JobDraft {
        JobDraft {
            operation: operation.parse().unwrap(),
            payload,
            webhook_url: "https://example.com/hook".to_owned(),
            correlation_id: None,
            path_root: None,
        }
    }

    fn images(n: usize) -> serde_json::Value {
        json!({ "images": (0..n).map(|i| format!("img_{i}.png")).collect::<Vec<_>>() })
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_queued_status() {
        let store = MemoryJobStore::new(3, 86400);
        let job = store.create(draft("caption", json!({}))).await.unwrap();

        assert!(!job.id.is_empty());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.workers_reserved, 0);

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = MemoryJobStore::new(3, 86400);
        let job = store.create(draft("caption", json!({}))).await.unwrap();

        store.enqueue(&job.id).await.unwrap();
        store.enqueue(&job.id).await.unwrap();

        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_skips_head_that_does_not_fit() {
        let store = MemoryJobStore::new(3, 86400);
        let big = store.create(draft("img2vid", images(60))).await.unwrap();
        let small = store.create(draft("caption", json!({}))).await.unwrap();
        store.enqueue(&big.id).await.unwrap();
        store.enqueue(&small.id).await.unwrap();

        // Only one worker free: the caption job overtakes the head.
        assert!(store.reserve(2).await.unwrap());
        let popped = store.dequeue_fittable().await.unwrap().unwrap();
        assert_eq!(popped.id, small.id);

        // The big job stays queued, at the head.
        assert_eq!(store.queued_ids().await.unwrap(), vec![big.id.clone()]);

        // With two workers free it dispatches.
        store.release(1).await.unwrap();
        let popped = store.dequeue_fittable().await.unwrap().unwrap();
        assert_eq!(popped.id, big.id);
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_when_nothing_fits() {
        let store = MemoryJobStore::new(3, 86400);
        let big = store.create(draft("img2vid", images(60))).await.unwrap();
        store.enqueue(&big.id).await.unwrap();

        assert!(store.reserve(2).await.unwrap());
        assert!(store.dequeue_fittable().await.unwrap().is_none());
        // Queue left intact.
        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_drops_stale_entries() {
        let store = MemoryJobStore::new(3, 86400);
        let cancelled = store.create(draft("caption", json!({}))).await.unwrap();
        let live = store.create(draft("caption", json!({}))).await.unwrap();
        store.enqueue(&cancelled.id).await.unwrap();
        store.enqueue("gone").await.unwrap();
        store.enqueue(&live.id).await.unwrap();

        store
            .update(
                &cancelled.id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let popped = store.dequeue_fittable().await.unwrap().unwrap();
        assert_eq!(popped.id, live.id);
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserve_rolls_back_on_underflow() {
        let store = MemoryJobStore::new(3, 86400);
        assert!(store.reserve(2).await.unwrap());
        assert!(!store.reserve(2).await.unwrap());
        assert_eq!(store.available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_clamps_at_max() {
        let store = MemoryJobStore::new(3, 86400);
        assert!(store.reserve(1).await.unwrap());
        assert_eq!(store.release(5).await.unwrap(), 3);
        assert_eq!(store.available().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_update_patch_and_listings() {
        let store = MemoryJobStore::new(3, 86400);
        let job = store.create(draft("concatenate", json!({}))).await.unwrap();

        store
            .update(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Submitted),
                    remote_job_ids: Some(vec!["r-1".to_owned()]),
                    workers_reserved: Some(1),
                    submitted_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].remote_job_ids, vec!["r-1".to_owned()]);
        assert!(store
            .by_status(JobStatus::Queued)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_job_errors() {
        let store = MemoryJobStore::new(3, 86400);
        let result = store.update("nope", JobPatch::default()).await;
        assert!(matches!(result, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_expired_sweeps_old_terminal_jobs() {
        let store = MemoryJobStore::new(3, 0);
        let done = store.create(draft("caption", json!({}))).await.unwrap();
        let running = store.create(draft("caption", json!({}))).await.unwrap();

        store
            .update(
                &done.id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    completed_at: Some(Utc::now() - Duration::seconds(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                &running.id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&done.id).await.unwrap().is_none());
        assert!(store.get(&running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = MemoryJobStore::new(3, 86400);
        let a = store.create(draft("caption", json!({}))).await.unwrap();
        let b = store.create(draft("caption", json!({}))).await.unwrap();
        store.enqueue(&a.id).await.unwrap();
        store.enqueue(&b.id).await.unwrap();
        store
            .update(
                &b.id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.available_workers, 3);
        assert_eq!(stats.max_workers, 3);
    }
}
