//! Thin client for the remote serverless GPU fleet.
//!
//! The control plane is three endpoints: submit, poll, cancel. Status
//! strings are consumed verbatim from the executor; a "job does not
//! exist" response is surfaced as its own error variant because the
//! monitor treats it as evidence of executor-side state loss.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use render_common::job::Operation;

/// Enumeration of errors for remote executor calls.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport error calling remote executor: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote executor returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("remote job {0} does not exist")]
    NotFound(String),
    #[error("{0} is not a valid remote job state")]
    ParseStateError(String),
}

/// Executor-side job states, verbatim from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RemoteState {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RemoteState::Failed | RemoteState::Cancelled | RemoteState::TimedOut
        )
    }
}

impl FromStr for RemoteState {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_QUEUE" => Ok(RemoteState::InQueue),
            "IN_PROGRESS" => Ok(RemoteState::InProgress),
            "COMPLETED" => Ok(RemoteState::Completed),
            "FAILED" => Ok(RemoteState::Failed),
            "CANCELLED" => Ok(RemoteState::Cancelled),
            "TIMED_OUT" => Ok(RemoteState::TimedOut),
            invalid => Err(RemoteError::ParseStateError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RemoteState::InQueue => write!(f, "IN_QUEUE"),
            RemoteState::InProgress => write!(f, "IN_PROGRESS"),
            RemoteState::Completed => write!(f, "COMPLETED"),
            RemoteState::Failed => write!(f, "FAILED"),
            RemoteState::Cancelled => write!(f, "CANCELLED"),
            RemoteState::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// One poll result for a remote sub-job.
#[derive(Debug, Clone)]
pub struct RemoteJobStatus {
    pub state: RemoteState,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// The submit/poll/cancel contract the dispatcher and monitor work
/// against. The HTTP implementation talks to the fleet; the mock
/// scripts outcomes for tests.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Submit one sub-job; returns the executor-assigned handle.
    async fn submit(&self, operation: &Operation, payload: &Value) -> Result<String, RemoteError>;

    /// Poll one sub-job. Idempotent and safe to call repeatedly.
    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus, RemoteError>;

    /// Best-effort cancel of one sub-job.
    async fn cancel(&self, remote_id: &str) -> Result<(), RemoteError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpRemoteExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteExecutor {
    pub fn new(base_url: &str, api_key: Option<&str>, request_timeout: Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = api_key {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {key}"))
                .expect("remote api key contains invalid header characters");
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("render-scheduler")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for remote executor");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn read_error(response: reqwest::Response) -> RemoteError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        RemoteError::Api { status, message }
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteExecutor {
    async fn submit(&self, operation: &Operation, payload: &Value) -> Result<String, RemoteError> {
        let body = json!({
            "input": {
                "operation": operation.to_string(),
                "payload": payload,
            }
        });
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let submitted: SubmitResponse = response.json().await?;
        Ok(submitted.id)
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus, RemoteError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.base_url, remote_id))
            .send()
            .await?;
        if response.status() == http::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(remote_id.to_owned()));
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let status: StatusResponse = response.json().await?;
        Ok(RemoteJobStatus {
            state: status.status.parse()?,
            output: status.output,
            error: status.error,
        })
    }

    async fn cancel(&self, remote_id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(format!("{}/cancel/{}", self.base_url, remote_id))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    submissions: Vec<(Operation, Value)>,
    statuses: HashMap<String, RemoteJobStatus>,
    not_found: HashSet<String>,
    cancelled: Vec<String>,
    fail_submissions_from: Option<usize>,
}

/// Scripted in-memory executor for scheduler tests. Submissions are
/// assigned ids `remote-0`, `remote-1`, … in order and start in
/// IN_QUEUE.
#[derive(Default)]
pub struct MockRemoteExecutor {
    state: Mutex<MockState>,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every submission starting at `index` (zero-based) fail.
    pub fn fail_submissions_from(&self, index: usize) {
        self.state.lock().unwrap().fail_submissions_from = Some(index);
    }

    pub fn set_state(&self, remote_id: &str, state: RemoteState) {
        let mut guard = self.state.lock().unwrap();
        let entry = guard
            .statuses
            .entry(remote_id.to_owned())
            .or_insert(RemoteJobStatus {
                state,
                output: None,
                error: None,
            });
        entry.state = state;
    }

    pub fn set_output(&self, remote_id: &str, output: Value) {
        let mut guard = self.state.lock().unwrap();
        guard.statuses.insert(
            remote_id.to_owned(),
            RemoteJobStatus {
                state: RemoteState::Completed,
                output: Some(output),
                error: None,
            },
        );
    }

    pub fn set_failure(&self, remote_id: &str, error: &str) {
        let mut guard = self.state.lock().unwrap();
        guard.statuses.insert(
            remote_id.to_owned(),
            RemoteJobStatus {
                state: RemoteState::Failed,
                output: None,
                error: Some(error.to_owned()),
            },
        );
    }

    /// Make polls for this id answer "does not exist".
    pub fn forget(&self, remote_id: &str) {
        self.state.lock().unwrap().not_found.insert(remote_id.to_owned());
    }

    pub fn submissions(&self) -> Vec<(Operation, Value)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn submit(&self, operation: &Operation, payload: &Value) -> Result<String, RemoteError> {
        let mut guard = self.state.lock().unwrap();
        let index = guard.submissions.len();
        if guard
            .fail_submissions_from
            .is_some_and(|from| index >= from)
        {
            return Err(RemoteError::Api {
                status: 503,
                message: "no capacity".to_owned(),
            });
        }
        guard.submissions.push((*operation, payload.clone()));
        let id = format!("remote-{index}");
        guard.statuses.insert(
            id.clone(),
            RemoteJobStatus {
                state: RemoteState::InQueue,
                output: None,
                error: None,
            },
        );
        Ok(id)
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteJobStatus, RemoteError> {
        let guard = self.state.lock().unwrap();
        if guard.not_found.contains(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_owned()));
        }
        guard
            .statuses
            .get(remote_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_owned()))
    }

    async fn cancel(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut guard = self.state.lock().unwrap();
        guard.cancelled.push(remote_id.to_owned());
        if let Some(status) = guard.statuses.get_mut(remote_id) {
            status.state = RemoteState::Cancelled;
        }
        Ok(())
    }
}
