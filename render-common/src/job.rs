//! # Job model
//!
//! The job record shared by the store, the dispatcher, the monitor and
//! the API surface. Payloads and results are kept as opaque
//! `serde_json::Value`s; the only structural field the scheduler ever
//! inspects is the `images` array of an `img2vid` payload.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Suffix that routes an operation to the local worker pool instead of
/// the remote GPU fleet.
pub const LOCAL_SUFFIX: &str = "_vps";

/// Image count above which an `img2vid` job is split across workers.
pub const SPLIT_THRESHOLD: usize = 30;

/// Images handled per additional worker when sizing a reservation.
pub const IMAGES_PER_WORKER: usize = 15;

/// Hard cap on the workers one job may reserve. Raising it changes
/// the head-of-line-skip behavior and needs a throughput measurement
/// first.
pub const MAX_WORKERS_PER_JOB: u32 = 2;

/// Enumeration of parse failures for job model strings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    InvalidStatus(String),
    #[error("{0} is not a known operation")]
    InvalidOperation(String),
}

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Accepted and waiting in the pending queue.
    Queued,
    /// Handed to the remote executor, not yet running.
    Submitted,
    /// At least one sub-job reported progress, or a local worker picked
    /// the job up.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition again and always carry
    /// `workers_reserved == 0`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses with live remote work the monitor must track.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Processing)
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "SUBMITTED" => Ok(JobStatus::Submitted),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            invalid => Err(ParseError::InvalidStatus(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Submitted => write!(f, "SUBMITTED"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

struct JobStatusVisitor;

impl<'de> Visitor<'de> for JobStatusVisitor {
    type Value = JobStatus;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of JobStatus")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        JobStatus::from_str(s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self)
        })
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(JobStatusVisitor)
    }
}

impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// The closed set of media operations the platform accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Img2Vid,
    Caption,
    CaptionSegments,
    CaptionHighlight,
    AddAudio,
    Concatenate,
    ConcatVideoAudio,
    Trilhasonora,
    Transcribe,
}

impl OperationKind {
    fn name(&self) -> &'static str {
        match self {
            OperationKind::Img2Vid => "img2vid",
            OperationKind::Caption => "caption",
            OperationKind::CaptionSegments => "caption_segments",
            OperationKind::CaptionHighlight => "caption_highlight",
            OperationKind::AddAudio => "addaudio",
            OperationKind::Concatenate => "concatenate",
            OperationKind::ConcatVideoAudio => "concat_video_audio",
            OperationKind::Trilhasonora => "trilhasonora",
            OperationKind::Transcribe => "transcribe",
        }
    }
}

/// An operation tag. The `_vps` suffix on the wire is the sole signal
/// that a job runs on the local pool; it is parsed once into `local`
/// so the rest of the scheduler matches on a flag instead of
/// re-inspecting strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind: OperationKind,
    pub local: bool,
}

impl Operation {
    pub fn remote(kind: OperationKind) -> Self {
        Self { kind, local: false }
    }

    pub fn local(kind: OperationKind) -> Self {
        Self { kind, local: true }
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, local) = match s.strip_suffix(LOCAL_SUFFIX) {
            Some(prefix) => (prefix, true),
            None => (s, false),
        };

        let kind = match name {
            "img2vid" => OperationKind::Img2Vid,
            "caption" => OperationKind::Caption,
            "caption_segments" => OperationKind::CaptionSegments,
            "caption_highlight" => OperationKind::CaptionHighlight,
            "addaudio" => OperationKind::AddAudio,
            "concatenate" => OperationKind::Concatenate,
            "concat_video_audio" => OperationKind::ConcatVideoAudio,
            "trilhasonora" => OperationKind::Trilhasonora,
            "transcribe" => OperationKind::Transcribe,
            _ => return Err(ParseError::InvalidOperation(s.to_owned())),
        };

        Ok(Operation { kind, local })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.local {
            write!(f, "{}{}", self.kind.name(), LOCAL_SUFFIX)
        } else {
            write!(f, "{}", self.kind.name())
        }
    }
}

struct OperationVisitor;

impl<'de> Visitor<'de> for OperationVisitor {
    type Value = Operation;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of an operation tag")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Operation::from_str(s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self)
        })
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(OperationVisitor)
    }
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A media-processing job as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier assigned at creation.
    pub id: String,
    /// The operation tag the job was created with.
    pub operation: Operation,
    /// Opaque payload forwarded to executors unchanged, except for the
    /// `images` chunking of oversize `img2vid` jobs.
    pub payload: Value,
    /// URL notified on every terminal transition.
    pub webhook_url: String,
    /// Caller-supplied correlation id, echoed in webhook payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<i64>,
    /// Caller-supplied path root, echoed in webhook payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_root: Option<String>,
    pub status: JobStatus,
    /// Executor-assigned handles, one per sub-submission, in
    /// submission order. Always empty for local-pool jobs.
    #[serde(default)]
    pub remote_job_ids: Vec<String>,
    /// Workers currently debited from the global counter on this job's
    /// behalf. Zero on all terminal states.
    #[serde(default)]
    pub workers_reserved: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Webhook delivery retries, advisory.
    #[serde(default)]
    pub retry_count: u32,
    /// Dispatch attempts, advisory.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// Number of entries in the payload's `images` array, zero when
    /// absent or not an array.
    pub fn image_count(&self) -> usize {
        self.payload
            .get("images")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    /// Workers this job debits from the global counter at dispatch.
    ///
    /// Only `img2vid` inspects its payload: jobs over
    /// `SPLIT_THRESHOLD` images reserve `ceil(n / IMAGES_PER_WORKER)`
    /// capped at `MAX_WORKERS_PER_JOB`. Everything else, including
    /// every local-pool operation, sizes to one.
    pub fn workers_needed(&self) -> u32 {
        if self.operation.local {
            return 1;
        }
        match self.operation.kind {
            OperationKind::Img2Vid => {
                let n = self.image_count();
                if n <= SPLIT_THRESHOLD {
                    1
                } else {
                    let split = n.div_ceil(IMAGES_PER_WORKER) as u32;
                    split.min(MAX_WORKERS_PER_JOB)
                }
            }
            _ => 1,
        }
    }
}

/// The caller-supplied part of a job, completed by the store with an
/// id, timestamps and the initial QUEUED status.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub operation: Operation,
    pub payload: Value,
    pub webhook_url: String,
    pub correlation_id: Option<i64>,
    pub path_root: Option<String>,
}

/// A partial overwrite applied by `JobStore::update`. `None` fields
/// are left untouched; the store never vetoes a patch, callers enforce
/// the status transition rules.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub remote_job_ids: Option<Vec<String>>,
    pub workers_reserved: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub attempts: Option<u32>,
}

impl JobPatch {
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(remote_job_ids) = &self.remote_job_ids {
            job.remote_job_ids = remote_job_ids.clone();
        }
        if let Some(workers_reserved) = self.workers_reserved {
            job.workers_reserved = workers_reserved;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        if let Some(submitted_at) = self.submitted_at {
            job.submitted_at = Some(submitted_at);
        }
        if let Some(processing_started_at) = self.processing_started_at {
            job.processing_started_at = Some(processing_started_at);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
    }
}
