//! Periodic audit of the worker counter against live job state.
//!
//! Run at startup and on a timer. The correction is computed from the
//! counter's current value, never by blind re-release: a terminal job
//! still carrying a reservation only moves the counter when the sum
//! over non-terminal jobs says workers are actually missing. That
//! makes the completion path's release-then-mark ordering safe against
//! a crash between the two writes.

use render_common::job::JobPatch;
use render_common::store::JobStore;
use tracing::{error, info, warn};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Terminal jobs whose stale `workers_reserved` was zeroed.
    pub residuals_zeroed: usize,
    /// Signed counter adjustment applied, zero when already consistent.
    pub correction: i64,
    /// Counter value after the audit.
    pub available: u32,
}

/// Audit and self-heal: zero residual reservations on terminal jobs,
/// then force the counter to `max_workers` minus the reservations of
/// non-terminal jobs.
pub async fn reconcile(
    store: &dyn JobStore,
    max_workers: u32,
) -> Result<ReconcileReport, SchedulerError> {
    let jobs = store.all_jobs().await?;

    let mut residuals_zeroed = 0;
    let mut reserved_active: u64 = 0;
    for job in &jobs {
        if job.status.is_terminal() {
            if job.workers_reserved > 0 {
                // Residue of a crash between release and the terminal
                // write; the release already happened.
                warn!(
                    job_id = job.id,
                    stale = job.workers_reserved,
                    "zeroing reservation left on terminal job"
                );
                store
                    .update(
                        &job.id,
                        JobPatch {
                            workers_reserved: Some(0),
                            ..Default::default()
                        },
                    )
                    .await?;
                residuals_zeroed += 1;
            }
        } else {
            reserved_active += u64::from(job.workers_reserved);
        }
    }

    let expected_available = if reserved_active > u64::from(max_workers) {
        error!(
            reserved_active,
            max_workers, "reservations exceed the fleet size, clamping counter to zero"
        );
        0
    } else {
        max_workers - reserved_active as u32
    };

    let available = store.available().await?;
    let correction = i64::from(expected_available) - i64::from(available);
    if correction != 0 {
        warn!(
            available,
            expected_available, correction, "worker counter drifted, correcting"
        );
        metrics::counter!("worker_counter_corrections_total").increment(1);
        store.set_available(expected_available).await?;
    }

    if residuals_zeroed > 0 || correction != 0 {
        info!(
            residuals_zeroed,
            correction, available = expected_available, "reconciliation applied"
        );
    }
    metrics::gauge!("workers_available").set(f64::from(expected_available));

    Ok(ReconcileReport {
        residuals_zeroed,
        correction,
        available: expected_available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use render_common::job::{Job, JobDraft, JobStatus};
    use render_common::store::MemoryJobStore;
    use serde_json::json;

    const MAX_WORKERS: u32 = 3;

    async fn job_in_state(
        store: &Arc<MemoryJobStore>,
        status: JobStatus,
        workers_reserved: u32,
    ) -> Job {
        let job = store
            .create(JobDraft {
                operation: "img2vid".parse().unwrap(),
                payload: json!({}),
                webhook_url: "http://127.0.0.1:1/hook".to_owned(),
                correlation_id: None,
                path_root: None,
            })
            .await
            .unwrap();
        store
            .update(
                &job.id,
                JobPatch {
                    status: Some(status),
                    workers_reserved: Some(workers_reserved),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_consistent_state_is_left_alone() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        job_in_state(&store, JobStatus::Submitted, 2).await;
        assert!(store.reserve(2).await.unwrap());

        let report = reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        assert_eq!(report.residuals_zeroed, 0);
        assert_eq!(report.correction, 0);
        assert_eq!(store.available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_crash_after_release_zeroes_without_recrediting() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        // The completion path released first, then crashed before the
        // terminal write zeroed the field: counter is already whole.
        let job = job_in_state(&store, JobStatus::Completed, 2).await;

        let report = reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        assert_eq!(report.residuals_zeroed, 1);
        assert_eq!(report.correction, 0);
        assert_eq!(
            store.get(&job.id).await.unwrap().unwrap().workers_reserved,
            0
        );
        assert_eq!(store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_crash_before_release_restores_counter() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        // Workers were reserved, then the process died before either
        // the release or the terminal write: the job record still says
        // FAILED with a reservation and the counter is short.
        assert!(store.reserve(2).await.unwrap());
        let job = job_in_state(&store, JobStatus::Failed, 2).await;

        let report = reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        assert_eq!(report.residuals_zeroed, 1);
        assert_eq!(report.correction, 2);
        assert_eq!(
            store.get(&job.id).await.unwrap().unwrap().workers_reserved,
            0
        );
        assert_eq!(store.available().await.unwrap(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_counter_lowered_for_unaccounted_reservations() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        // An active job holds two workers but the counter was never
        // decremented (e.g. a lost write): reconciliation debits it.
        job_in_state(&store, JobStatus::Processing, 2).await;

        let report = reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        assert_eq!(report.correction, -2);
        assert_eq!(store.available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overcommitted_reservations_clamp_to_zero() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        job_in_state(&store, JobStatus::Processing, 2).await;
        job_in_state(&store, JobStatus::Submitted, 2).await;

        let report = reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        assert_eq!(report.available, 0);
        assert_eq!(store.available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_restores_conservation_invariant() {
        let store: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new(MAX_WORKERS, 86400));
        assert!(store.reserve(1).await.unwrap());
        job_in_state(&store, JobStatus::Submitted, 1).await;
        job_in_state(&store, JobStatus::Completed, 2).await;
        job_in_state(&store, JobStatus::Cancelled, 1).await;

        reconcile(store.as_ref(), MAX_WORKERS).await.unwrap();

        // available + sum of non-terminal reservations == fleet size.
        let jobs = store.all_jobs().await.unwrap();
        let reserved: u32 = jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.workers_reserved)
            .sum();
        assert_eq!(store.available().await.unwrap() + reserved, MAX_WORKERS);
    }
}
