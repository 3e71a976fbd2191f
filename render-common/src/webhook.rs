//! Webhook payload types and the callback-URL guard applied at job
//! creation.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::job::{Job, JobStatus, Operation};

/// Which executor class ran the job, reported in webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    #[serde(rename = "GPU")]
    Gpu,
    #[serde(rename = "VPS")]
    Vps,
}

impl Processor {
    pub fn for_operation(operation: &Operation) -> Self {
        if operation.local {
            Processor::Vps
        } else {
            Processor::Gpu
        }
    }

    /// Informational worker label for the execution block.
    pub fn worker_label(&self) -> &'static str {
        match self {
            Processor::Gpu => "gpu-fleet",
            Processor::Vps => "local-pool",
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Processor::Gpu => write!(f, "GPU"),
            Processor::Vps => write!(f, "VPS"),
        }
    }
}

/// Informational execution block of a webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub duration_seconds: f64,
    pub worker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

/// The body POSTed to the caller's webhook on every terminal
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: JobStatus,
    pub operation: Operation,
    pub processor: Processor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution: ExecutionInfo,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// Build the terminal payload for a job that has already been
    /// patched to its final state.
    pub fn for_job(job: &Job) -> Self {
        let processor = Processor::for_operation(&job.operation);
        let start_time = job
            .processing_started_at
            .or(job.submitted_at)
            .or(Some(job.created_at));
        let end_time = job.completed_at;
        let duration_ms = match (start_time, end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => 0,
        };
        let codec = job
            .result
            .as_ref()
            .and_then(|result| result.get("codec"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Self {
            job_id: job.id.clone(),
            status: job.status,
            operation: job.operation,
            processor,
            correlation_id: job.correlation_id,
            path_root: job.path_root.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            execution: ExecutionInfo {
                start_time,
                end_time,
                duration_ms,
                duration_seconds: duration_ms as f64 / 1000.0,
                worker: processor.worker_label().to_owned(),
                codec,
            },
            timestamp: Utc::now(),
        }
    }
}

/// Enumeration of reasons a webhook URL is rejected at job creation.
#[derive(Error, Debug)]
pub enum WebhookUrlError {
    #[error("could not parse webhook url")]
    ParseError(#[from] url::ParseError),
    #[error("webhook url scheme must be http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("webhook url has no host")]
    MissingHost,
    #[error("webhook host did not resolve: {0}")]
    ResolutionError(std::io::Error),
    #[error("webhook host resolves to a non-public address")]
    NonPublicAddress,
}

/// Returns true if the address appears to be a globally reachable
/// IPv4. IPv6 results are rejected wholesale, matching the egress
/// network. Trimmed down version of the unstable `IpAddr::is_global`.
fn is_public_ipv4(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => {
            !(ip.octets()[0] == 0 // "This network"
                || ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast())
        }
        IpAddr::V6(_) => false,
    }
}

/// Validate a caller-supplied webhook URL before a job is accepted.
///
/// Delivery happens much later, from inside the network, so the guard
/// runs here: http(s) scheme only, and every address the host resolves
/// to must be publicly routable. A rejection fails job creation.
pub async fn validate_webhook_url(raw: &str) -> Result<(), WebhookUrlError> {
    let url = Url::parse(raw)?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(WebhookUrlError::UnsupportedScheme(scheme.to_owned()));
    }

    // IP literals short-circuit DNS.
    let domain = match url.host().ok_or(WebhookUrlError::MissingHost)? {
        url::Host::Ipv4(ip) => {
            if !is_public_ipv4(&IpAddr::V4(ip)) {
                return Err(WebhookUrlError::NonPublicAddress);
            }
            return Ok(());
        }
        url::Host::Ipv6(_) => return Err(WebhookUrlError::NonPublicAddress),
        url::Host::Domain(domain) => domain.to_owned(),
    };

    let port = url.port_or_known_default().unwrap_or(80);
    let mut resolved = tokio::net::lookup_host((domain.as_str(), port))
        .await
        .map_err(WebhookUrlError::ResolutionError)?
        .peekable();

    if resolved.peek().is_none() {
        return Err(WebhookUrlError::NonPublicAddress);
    }
    if resolved.any(|addr| !is_public_ipv4(&addr.ip())) {
        return Err(WebhookUrlError::NonPublicAddress);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    fn finished_job() -> Job {
        let created = Utc::now() - chrono::Duration::seconds(90);
        Job {
            id: "job-1".to_owned(),
            operation: "img2vid".parse().unwrap(),
            payload: json!({"images": ["a.png"]}),
            webhook_url: "http://8.8.8.8/hook".to_owned(),
            correlation_id: Some(7),
            path_root: Some("batch/42".to_owned()),
            status: JobStatus::Completed,
            remote_job_ids: vec!["r-1".to_owned()],
            workers_reserved: 0,
            result: Some(json!({"code": 200, "codec": "h264", "videos": []})),
            error: None,
            created_at: created,
            submitted_at: Some(created + chrono::Duration::seconds(5)),
            processing_started_at: Some(created + chrono::Duration::seconds(10)),
            completed_at: Some(created + chrono::Duration::seconds(70)),
            retry_count: 0,
            attempts: 1,
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload::for_job(&finished_job());
        let encoded = serde_json::to_value(&payload).unwrap();

        assert_json_include!(
            actual: encoded,
            expected: json!({
                "job_id": "job-1",
                "status": "COMPLETED",
                "operation": "img2vid",
                "processor": "GPU",
                "correlation_id": 7,
                "path_root": "batch/42",
                "execution": {
                    "duration_ms": 60000,
                    "duration_seconds": 60.0,
                    "worker": "gpu-fleet",
                    "codec": "h264",
                },
            })
        );
    }

    #[test]
    fn test_processor_follows_operation_routing() {
        let gpu = Processor::for_operation(&"caption".parse().unwrap());
        let vps = Processor::for_operation(&"caption_vps".parse().unwrap());
        assert_eq!(gpu, Processor::Gpu);
        assert_eq!(vps, Processor::Vps);
    }

    #[test]
    fn test_anchor_falls_back_without_processing_stamp() {
        let mut job = finished_job();
        job.processing_started_at = None;
        let payload = WebhookPayload::for_job(&job);
        assert_eq!(payload.execution.start_time, job.submitted_at);
    }

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        let result = validate_webhook_url("ftp://example.com/hook").await;
        assert!(matches!(result, Err(WebhookUrlError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_rejects_unparseable_url() {
        assert!(validate_webhook_url("not a url").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_loopback_and_private_literals() {
        for url in [
            "http://127.0.0.1/hook",
            "http://10.1.2.3/hook",
            "http://192.168.0.10:8080/hook",
            "http://169.254.1.1/hook",
            "http://[::1]/hook",
        ] {
            let result = validate_webhook_url(url).await;
            assert!(
                matches!(result, Err(WebhookUrlError::NonPublicAddress)),
                "{url} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_accepts_public_literal() {
        assert!(validate_webhook_url("https://8.8.8.8/hook").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_localhost_hostname() {
        let result = validate_webhook_url("http://localhost:9999/hook").await;
        assert!(result.is_err());
    }
}
