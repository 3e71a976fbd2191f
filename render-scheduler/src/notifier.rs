//! Webhook delivery with bounded retry and dead-letter behavior.
//!
//! Each delivery owns a spawned task with its own retry timer, so a
//! slow receiver can never stall completion handling. Exhausting the
//! retry budget emits a structured dead-letter record and annotates
//! the job's error field; the terminal status is never reopened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header;
use sha2::Sha256;
use tracing::{debug, error, warn};

use render_common::job::{Job, JobPatch};
use render_common::store::JobStore;
use render_common::webhook::WebhookPayload;

type HmacSha256 = Hmac<Sha256>;

/// Delays applied before retries one, two, three; later retries reuse
/// the last entry.
const RETRY_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

/// Hex HMAC-SHA256 of the request body, as carried in
/// `X-Webhook-Signature`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct WebhookNotifier {
    store: Arc<dyn JobStore>,
    client: reqwest::Client,
    secret: Option<String>,
    max_attempts: u32,
    retry_delays: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(
        store: Arc<dyn JobStore>,
        secret: Option<String>,
        max_attempts: u32,
        request_timeout: Duration,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("render-orchestrator")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for webhook notifier");

        Self {
            store,
            client,
            secret,
            max_attempts,
            retry_delays: RETRY_DELAYS.to_vec(),
        }
    }

    /// Shrink the retry schedule; test hook.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Fire the terminal webhook for a job. Called exactly once per
    /// terminal transition; everything after this point, including
    /// retries, runs in a task of its own.
    pub fn dispatch(self: &Arc<Self>, job: &Job) {
        let payload = WebhookPayload::for_job(job);
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.deliver(payload).await;
        });
    }

    async fn deliver(&self, payload: WebhookPayload) {
        let job_id = payload.job_id.clone();
        let url = self
            .store
            .get(&job_id)
            .await
            .ok()
            .flatten()
            .map(|job| job.webhook_url)
            .unwrap_or_default();
        if url.is_empty() {
            warn!(job_id, "webhook delivery skipped, job record is gone");
            return;
        }

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                error!(job_id, "failed to encode webhook payload: {}", err);
                return;
            }
        };
        let status = payload.status.to_string();
        let mut last_error = String::new();

        for attempt in 0..=self.max_attempts {
            if attempt > 0 {
                let delay_index = (attempt as usize - 1).min(self.retry_delays.len() - 1);
                tokio::time::sleep(self.retry_delays[delay_index]).await;
            }

            let attempt_started = std::time::Instant::now();
            match self.post(&url, &job_id, &status, &body).await {
                Ok(()) => {
                    debug!(job_id, url, attempt, "webhook delivered");
                    metrics::counter!("webhook_deliveries_total").increment(1);
                    metrics::histogram!("webhook_delivery_seconds")
                        .record(attempt_started.elapsed().as_secs_f64());
                    if attempt > 0 {
                        self.record_retries(&job_id, attempt).await;
                    }
                    return;
                }
                Err(err) => {
                    warn!(job_id, url, attempt, "webhook delivery failed: {}", err);
                    metrics::counter!("webhook_attempts_failed_total").increment(1);
                    last_error = err;
                }
            }
        }

        self.dead_letter(&job_id, &url, &last_error).await;
    }

    async fn post(
        &self,
        url: &str,
        job_id: &str,
        status: &str,
        body: &[u8],
    ) -> Result<(), String> {
        let mut request = self
            .client
            .post(url)
            .header("X-Webhook-JobId", job_id)
            .header("X-Webhook-Status", status)
            .header("X-Webhook-Timestamp", Utc::now().to_rfc3339())
            .body(body.to_vec());

        if let Some(secret) = &self.secret {
            request = request.header(
                "X-Webhook-Signature",
                format!("sha256={}", sign_body(secret, body)),
            );
        }

        let response = request.send().await.map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("receiver answered {}", response.status()))
        }
    }

    async fn record_retries(&self, job_id: &str, retries: u32) {
        let patch = JobPatch {
            retry_count: Some(retries),
            ..Default::default()
        };
        if let Err(err) = self.store.update(job_id, patch).await {
            warn!(job_id, "failed to record webhook retries: {}", err);
        }
    }

    /// Terminal sink for deliveries that exhausted the retry budget.
    async fn dead_letter(&self, job_id: &str, url: &str, last_error: &str) {
        error!(
            job_id,
            url,
            attempts = self.max_attempts + 1,
            last_error,
            "webhook delivery dead-lettered"
        );
        metrics::counter!("webhook_dead_letters_total").increment(1);

        let annotation = format!(
            "webhook delivery failed after {} attempts: {}",
            self.max_attempts + 1,
            last_error
        );
        let existing = self.store.get(job_id).await.ok().flatten();
        let error = match existing.and_then(|job| job.error) {
            Some(previous) => format!("{previous}; {annotation}"),
            None => annotation,
        };
        let patch = JobPatch {
            error: Some(error),
            retry_count: Some(self.max_attempts),
            ..Default::default()
        };
        if let Err(err) = self.store.update(job_id, patch).await {
            warn!(job_id, "failed to annotate dead-lettered webhook: {}", err);
        }
    }
}
